//! # Closing and Copying
//!
//! Dropping an end of a pipe without closing it counts as abandonment, so
//! code that owns a stream must release it explicitly. `Close` is that
//! release, and `copy_thread` pumps one stream into another and closes both.

use std::fs::File;
use std::io;
use std::io::Cursor;
use std::io::Read;
use std::io::Write;
use std::net::Shutdown;
use std::net::TcpStream;
use std::thread;
use std::thread::JoinHandle;

const COPY_BUFFER: usize = 8192;

/// Explicit end-of-use for a stream.
pub trait Close {
    fn close(&mut self) -> io::Result<()>;
}

impl<T: Close + ?Sized> Close for Box<T> {
    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

impl Close for Vec<u8> {
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<T> Close for Cursor<T> {
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Close for &[u8] {
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Close for io::Sink {
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Close for File {
    fn close(&mut self) -> io::Result<()> {
        self.flush()
    }
}

impl Close for TcpStream {
    fn close(&mut self) -> io::Result<()> {
        match self.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

/// Spawns a named thread that copies `reader` into `writer` until EOF, then
/// closes both. The handle yields the number of bytes copied.
///
/// Both streams are closed even when the copy fails; the copy error wins
/// over close errors.
pub fn copy_thread<R, W>(
    name: impl Into<String>,
    mut reader: R,
    mut writer: W,
) -> io::Result<JoinHandle<io::Result<u64>>>
where
    R: Read + Close + Send + 'static,
    W: Write + Close + Send + 'static,
{
    let name = name.into();
    let thread_name = name.clone();

    thread::Builder::new().name(thread_name).spawn(move || {
        let copied = copy_until_eof(&mut reader, &mut writer);
        let closed_in = reader.close();
        let closed_out = writer.close();

        if let Err(e) = &copied {
            tracing::debug!(thread = %name, error = %e, "copy thread stopped");
        }

        let copied = copied?;
        closed_in?;
        closed_out?;
        Ok(copied)
    })
}

fn copy_until_eof<R: Read, W: Write>(reader: &mut R, writer: &mut W) -> io::Result<u64> {
    let mut buf = [0u8; COPY_BUFFER];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
    writer.flush()?;
    Ok(total)
}
