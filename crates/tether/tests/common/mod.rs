//! Shared callables, invocables and channel pairs for the integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use serde::Serializer;

use tether::CallContext;
use tether::Callable;
use tether::Channel;
use tether::ChannelBuilder;
use tether::DuplexChannelTransport;
use tether::Invocable;
use tether::InvocationError;
use tether::RemoteRef;
use tether::RemoteWriter;
use tether::invoke::decode_args;
use tether::invoke::encode_result;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// --- Errors ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestError {
    pub message: String,
}

impl TestError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TestError {}

/// An error that refuses to be serialized.
#[derive(Debug, Deserialize)]
pub struct FragileError {
    pub detail: String,
}

impl Serialize for FragileError {
    fn serialize<S: Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
        Err(serde::ser::Error::custom("fragile errors stay home"))
    }
}

impl std::fmt::Display for FragileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fragile: {}", self.detail)
    }
}

impl std::error::Error for FragileError {}

// --- Callables ---

#[derive(Serialize, Deserialize)]
pub struct Add {
    pub a: u64,
    pub b: u64,
}

impl Callable for Add {
    type Output = u64;
    type Error = TestError;
    const NAME: &'static str = "test.add";

    fn call(self, _: &CallContext) -> Result<u64, TestError> {
        self.a.checked_add(self.b).ok_or_else(|| TestError::new("overflow"))
    }
}

#[derive(Serialize, Deserialize)]
pub struct Divide {
    pub a: u64,
    pub b: u64,
}

impl Callable for Divide {
    type Output = u64;
    type Error = TestError;
    const NAME: &'static str = "test.divide";

    fn call(self, _: &CallContext) -> Result<u64, TestError> {
        if self.b == 0 {
            return Err(TestError::new(format!("cannot divide {} by zero", self.a)));
        }
        Ok(self.a / self.b)
    }
}

/// Tokens of `Sleepy` calls that ran to completion.
pub fn finished_sleepers() -> &'static Mutex<HashSet<u64>> {
    static FINISHED: OnceLock<Mutex<HashSet<u64>>> = OnceLock::new();
    FINISHED.get_or_init(|| Mutex::new(HashSet::new()))
}

pub fn next_token() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Sleeps in small steps, giving up early once cancelled.
#[derive(Serialize, Deserialize)]
pub struct Sleepy {
    pub millis: u64,
    pub token: u64,
}

impl Callable for Sleepy {
    type Output = u64;
    type Error = TestError;
    const NAME: &'static str = "test.sleepy";

    fn call(self, ctx: &CallContext) -> Result<u64, TestError> {
        let mut slept = 0;
        while slept < self.millis {
            if ctx.is_cancelled() {
                return Err(TestError::new("cancelled"));
            }
            thread::sleep(Duration::from_millis(10));
            slept += 10;
        }
        finished_sleepers().lock().unwrap().insert(self.token);
        Ok(self.token)
    }
}

#[derive(Serialize, Deserialize)]
pub struct Panicker;

impl Callable for Panicker {
    type Output = ();
    type Error = TestError;
    const NAME: &'static str = "test.panicker";

    fn call(self, _: &CallContext) -> Result<(), TestError> {
        panic!("panicker always panics")
    }
}

#[derive(Serialize, Deserialize)]
pub struct Fragile;

impl Callable for Fragile {
    type Output = ();
    type Error = FragileError;
    const NAME: &'static str = "test.fragile";

    fn call(self, _: &CallContext) -> Result<(), FragileError> {
        Err(FragileError { detail: "vase".into() })
    }
}

/// Never registered on the receiving side.
#[derive(Serialize, Deserialize)]
pub struct Orphan;

impl Callable for Orphan {
    type Output = ();
    type Error = TestError;
    const NAME: &'static str = "test.orphan";

    fn call(self, _: &CallContext) -> Result<(), TestError> {
        Ok(())
    }
}

/// Reports which module it was resolved in.
#[derive(Serialize, Deserialize)]
pub struct WhichModule {
    pub module: Option<String>,
}

impl Callable for WhichModule {
    type Output = String;
    type Error = TestError;
    const NAME: &'static str = "test.which-module";

    fn call(self, ctx: &CallContext) -> Result<String, TestError> {
        Ok(ctx.module_name().to_string())
    }

    fn context(&self) -> Option<String> {
        self.module.clone()
    }
}

/// Hands a reference straight back to its sender.
#[derive(Serialize, Deserialize)]
pub struct Bounce {
    pub reference: RemoteRef<Token>,
}

impl Callable for Bounce {
    type Output = RemoteRef<Token>;
    type Error = TestError;
    const NAME: &'static str = "test.bounce";

    fn call(self, _: &CallContext) -> Result<RemoteRef<Token>, TestError> {
        Ok(self.reference)
    }
}

pub struct Token {
    pub label: String,
}

/// Adds on the receiver by calling back into the requester.
#[derive(Serialize, Deserialize)]
pub struct CallBack {
    pub a: u64,
    pub b: u64,
}

impl Callable for CallBack {
    type Output = u64;
    type Error = TestError;
    const NAME: &'static str = "test.call-back";

    fn call(self, ctx: &CallContext) -> Result<u64, TestError> {
        ctx.channel()
            .call_blocking(Add { a: self.a, b: self.b })
            .map_err(|e| TestError::new(format!("call back failed: {}", e)))
    }
}

/// Writes `text` into a stream exported by the requester.
#[derive(Serialize, Deserialize)]
pub struct WriteTo {
    pub writer: RemoteWriter,
    pub text: String,
}

impl Callable for WriteTo {
    type Output = usize;
    type Error = TestError;
    const NAME: &'static str = "test.write-to";

    fn call(self, ctx: &CallContext) -> Result<usize, TestError> {
        use std::io::Write;
        use tether::Close;

        let io_err = |e: std::io::Error| TestError::new(e.to_string());
        let mut writer = self
            .writer
            .connect(ctx.channel())
            .map_err(|e| TestError::new(e.to_string()))?;
        for chunk in self.text.as_bytes().chunks(100) {
            writer.write_all(chunk).map_err(io_err)?;
        }
        writer.close().map_err(io_err)?;
        Ok(self.text.len())
    }
}

pub fn gauge() -> &'static (AtomicUsize, AtomicUsize) {
    static GAUGE: (AtomicUsize, AtomicUsize) = (AtomicUsize::new(0), AtomicUsize::new(0));
    &GAUGE
}

/// Records how many gauges run at once.
#[derive(Serialize, Deserialize)]
pub struct Gauge {
    pub millis: u64,
}

impl Callable for Gauge {
    type Output = ();
    type Error = TestError;
    const NAME: &'static str = "test.gauge";

    fn call(self, _: &CallContext) -> Result<(), TestError> {
        let (current, peak) = gauge();
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(self.millis));
        current.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

// --- Invocables ---

pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self { value: AtomicU64::new(0) }
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }
}

impl Invocable for Counter {
    fn interface(&self) -> &str {
        "counter"
    }

    fn invoke(&self, method: &str, args: &[u8], _: &CallContext) -> Result<Vec<u8>, InvocationError> {
        match method {
            "add" => {
                let by: u64 = decode_args(args)?;
                encode_result(&(self.value.fetch_add(by, Ordering::SeqCst) + by))
            }
            "get" => encode_result(&self.get()),
            other => Err(InvocationError::no_such_method(self.interface(), other)),
        }
    }
}

pub struct Secret;

impl Invocable for Secret {
    fn interface(&self) -> &str {
        "secret"
    }

    fn invoke(&self, _: &str, _: &[u8], _: &CallContext) -> Result<Vec<u8>, InvocationError> {
        encode_result(&"the cake is a lie")
    }
}

// --- Channel pairs ---

/// A builder that knows every test callable except `Orphan`.
pub fn builder(name: &str) -> ChannelBuilder {
    ChannelBuilder::new(name)
        .register::<Add>()
        .register::<Divide>()
        .register::<Sleepy>()
        .register::<Panicker>()
        .register::<Fragile>()
        .register::<WhichModule>()
        .register::<Bounce>()
        .register::<CallBack>()
        .register::<WriteTo>()
        .register::<Gauge>()
}

pub async fn pair_with(a: ChannelBuilder, b: ChannelBuilder) -> (Channel, Channel) {
    init_tracing();
    let (ta, tb) = DuplexChannelTransport::pair();
    let (a, b) = tokio::join!(a.start(ta), b.start(tb));
    (a.expect("channel a failed to start"), b.expect("channel b failed to start"))
}

pub async fn pair() -> (Channel, Channel) {
    pair_with(builder("a"), builder("b")).await
}
