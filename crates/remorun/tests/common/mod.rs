//! Shared fixtures: a calculator runner, a counter runner only the host
//! knows about, and a helper that links a client and a host in-process.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;

use remorun::Port;
use remorun::ResolvedRunner;
use remorun::Runner;
use remorun::RunnerDefinition;
use remorun::RunnerResolverClient;
use remorun::RunnerResolverHost;
use remorun::RunnerValue;
use remorun::StrategyKind;

pub const CALC_METHODS: &[&str] = &["add", "fail", "apply", "child", "children", "echo", "hang"];

pub struct Calc {
    destroyed: Arc<AtomicUsize>,
}

fn int(value: Option<RunnerValue>) -> anyhow::Result<i64> {
    Ok(value.context("missing argument")?.parse::<i64>()?)
}

#[async_trait::async_trait]
impl Runner for Calc {
    async fn execute(&self, method: &str, args: Vec<RunnerValue>) -> anyhow::Result<RunnerValue> {
        let mut args = args.into_iter();
        match method {
            "add" => {
                let (a, b) = (int(args.next())?, int(args.next())?);
                Ok(RunnerValue::json(a + b)?)
            }
            "fail" => anyhow::bail!("calculator is broken"),
            // Calls `add` on another runner and scales the result.
            "apply" => {
                let other = args.next().context("missing runner")?;
                let (a, b) = (int(args.next())?, int(args.next())?);
                let sum: i64 = match other {
                    RunnerValue::Runner(runner) => runner.call_json("add", (a, b)).await?,
                    other => anyhow::bail!("expected a runner, got {}", other.kind_name()),
                };
                Ok(RunnerValue::json(sum * 10)?)
            }
            "child" => Ok(RunnerValue::Local(self.spawn_child())),
            "children" => Ok(RunnerValue::Array(vec![
                RunnerValue::Local(self.spawn_child()),
                RunnerValue::json("tag")?,
            ])),
            "echo" => Ok(args.next().unwrap_or_else(RunnerValue::null)),
            "hang" => futures::future::pending().await,
            other => anyhow::bail!("unhandled method {}", other),
        }
    }

    async fn destroy(&self) -> anyhow::Result<()> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Calc {
    pub fn new(destroyed: Arc<AtomicUsize>) -> Self {
        Self { destroyed }
    }

    fn spawn_child(&self) -> remorun::LocalRunner {
        calc(self.destroyed.clone()).local(Calc::new(self.destroyed.clone()))
    }
}

/// `Calc`; constructing with the argument `"explode"` fails.
pub fn calc(destroyed: Arc<AtomicUsize>) -> RunnerDefinition {
    RunnerDefinition::new(CALC_METHODS, move |args: Vec<RunnerValue>| {
        let destroyed = destroyed.clone();
        async move {
            if let Some(RunnerValue::Json(serde_json::Value::String(flag))) = args.first() {
                if flag == "explode" {
                    anyhow::bail!("constructor refused");
                }
            }
            Ok(Calc::new(destroyed))
        }
    })
}

pub struct Counter {
    value: AtomicI64,
}

#[async_trait::async_trait]
impl Runner for Counter {
    async fn execute(&self, method: &str, args: Vec<RunnerValue>) -> anyhow::Result<RunnerValue> {
        match method {
            "increment" => {
                let by = match args.into_iter().next() {
                    Some(by) => by.parse::<i64>()?,
                    None => 1,
                };
                Ok(RunnerValue::json(self.value.fetch_add(by, Ordering::SeqCst) + by)?)
            }
            "get" => Ok(RunnerValue::json(self.value.load(Ordering::SeqCst))?),
            other => anyhow::bail!("unhandled method {}", other),
        }
    }
}

/// `Counter` starting from its optional first argument.
pub fn counter() -> RunnerDefinition {
    RunnerDefinition::new(&["increment", "get"], |args: Vec<RunnerValue>| async move {
        let start = match args.into_iter().next() {
            Some(start) => start.parse::<i64>()?,
            None => 0,
        };
        Ok(Counter {
            value: AtomicI64::new(start),
        })
    })
}

pub struct Link {
    pub client: RunnerResolverClient,
    pub host: RunnerResolverHost,
    pub destroyed: Arc<AtomicUsize>,
}

impl Link {
    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }
}

/// Routes library logs to the test harness; filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A running client/host pair over an in-memory port.
pub async fn link(strategy: StrategyKind) -> Link {
    init_tracing();
    let destroyed = Arc::new(AtomicUsize::new(0));
    let (a, b) = Port::pair();

    let client = RunnerResolverClient::builder(a)
        .runner(calc(destroyed.clone()))
        .strategies([strategy.clone()])
        .build()
        .expect("client builds");
    let host = RunnerResolverHost::builder(b)
        .runner(calc(destroyed.clone()))
        .runner(counter())
        .strategies([strategy])
        .handshake_grace(Duration::from_millis(10))
        .build()
        .expect("host builds");

    let (c, h) = tokio::join!(client.run(), host.run());
    c.expect("client runs");
    h.expect("host runs");

    Link {
        client,
        host,
        destroyed,
    }
}

pub const STRATEGIES: [StrategyKind; 2] = [StrategyKind::MessageChannel, StrategyKind::RepeatConnection];

/// Waits for a proxy to observe that its link has closed.
pub async fn wait_closed(runner: &ResolvedRunner) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !runner.is_closed() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("proxy closes in time");
}

/// Polls `check` until it holds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition holds in time");
}
