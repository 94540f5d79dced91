//! Proxy streams: remote writers feeding local pipes.

mod common;

use std::io::Read;
use std::io::Write;
use std::time::Duration;

use tether::Close;
use tether::Command;
use tether::Error;
use tether::Handle;
use tether::ProxyWriter;
use tether_pipe::PipeError;
use tether_pipe::PipeReader;

use common::*;

fn drain(mut reader: PipeReader) -> tokio::task::JoinHandle<std::io::Result<Vec<u8>>> {
    tokio::task::spawn_blocking(move || {
        let mut out = Vec::new();
        reader.read_to_end(&mut out)?;
        reader.close()?;
        Ok(out)
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_writer_into_pipe() {
    let (a, _b) = pair().await;
    let (remote, reader) = a.open_pipe(1024).unwrap();
    let text: String = (0..10_000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();

    // The pipe is smaller than the text; the call still completes before
    // anything reads from it.
    let written = a.call(WriteTo { writer: remote, text: text.clone() }).await.unwrap();

    assert_eq!(written, text.len());
    assert_eq!(drain(reader).await.unwrap().unwrap(), text.as_bytes());
    // Eof released the export.
    assert!(a.exports().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_proxy_writer_buffers_until_connected() {
    let (a, b) = pair().await;
    let (remote, reader) = a.open_pipe(256).unwrap();
    let received = drain(reader);

    let mut writer = ProxyWriter::new();
    writer.write_all(b"early ").unwrap();
    assert!(!writer.is_connected());
    writer.connect(&b, remote.handle()).unwrap();
    writer.write_all(b"late").unwrap();
    writer.close().unwrap();

    assert_eq!(received.await.unwrap().unwrap(), b"early late");
}

#[tokio::test]
async fn test_connect_twice_is_protocol_violation() {
    let (a, b) = pair().await;
    let (remote, _reader) = a.open_pipe(64).unwrap();

    let mut writer = remote.connect(&b).unwrap();
    let err = writer.connect(&b, remote.handle()).unwrap_err();
    assert!(matches!(err, Error::ProtocolViolation(msg) if msg == "Cannot connect twice"));
}

#[tokio::test]
async fn test_write_after_close_fails_locally() {
    let (a, b) = pair().await;
    let (remote, _reader) = a.open_pipe(64).unwrap();

    let mut writer = remote.connect(&b).unwrap();
    writer.close().unwrap();
    let err = writer.write(b"late").unwrap_err();
    assert_eq!(err.to_string(), "stream is already closed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropping_connected_writer_closes_stream() {
    let (a, b) = pair().await;
    let (remote, reader) = a.open_pipe(64).unwrap();
    let received = drain(reader);

    {
        let mut writer = remote.connect(&b).unwrap();
        writer.write_all(b"bye").unwrap();
    }

    assert_eq!(received.await.unwrap().unwrap(), b"bye");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_pipe_does_not_stall_other_traffic() {
    let (a, b) = pair().await;
    let (remote, reader) = a.open_pipe(16).unwrap();

    let mut writer = remote.connect(&b).unwrap();
    writer.write_all(&[7u8; 64]).unwrap();
    writer.close().unwrap();

    // Nothing reads the pipe yet, so its writer is stuck on a full buffer.
    tokio::time::timeout(Duration::from_secs(5), a.ping()).await.unwrap().unwrap();
    let sum = tokio::time::timeout(Duration::from_secs(5), a.call(Add { a: 2, b: 3 })).await.unwrap();
    assert_eq!(sum.unwrap(), 5);

    assert_eq!(drain(reader).await.unwrap().unwrap(), vec![7u8; 64]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_scoped_pipe_is_released_with_the_call() {
    let (a, _b) = pair().await;
    let scope = a.export_scope();
    let (remote, reader) = scope.open_pipe(64).unwrap();
    let received = drain(reader);

    let written = a.call_scoped(WriteTo { writer: remote, text: "scoped".into() }, scope).await.unwrap();

    assert_eq!(written, 6);
    assert_eq!(received.await.unwrap().unwrap(), b"scoped");
    assert!(a.exports().is_empty());
}

#[tokio::test]
async fn test_chunk_for_unknown_handle_is_dropped() {
    let (a, b) = pair().await;
    b.submit(Command::Chunk { handle: Handle(4242), data: b"lost".to_vec() }).unwrap();
    b.submit(Command::Eof { handle: Handle(4242) }).unwrap();
    b.ping().await.unwrap();
    assert!(!a.is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_termination_abandons_open_pipes() {
    let (a, b) = pair().await;
    let (_remote, mut reader) = a.open_pipe(64).unwrap();

    b.close().unwrap();
    a.join().await.unwrap();
    assert!(a.exports().is_empty());

    let outcome = tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 8];
        reader.read(&mut buf)
    });
    let err = tokio::time::timeout(Duration::from_secs(5), outcome)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(PipeError::from_io(&err), Some(PipeError::SourceAbandoned)));
}
