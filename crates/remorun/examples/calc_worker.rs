//! Hosts a calculator in a worker thread and calls it from the main runtime.
//!
//! ```sh
//! RUST_LOG=remorun=debug cargo run -p remorun --example calc_worker
//! ```

use remorun::Runner;
use remorun::RunnerDefinition;
use remorun::RunnerResolverClient;
use remorun::RunnerResolverHost;
use remorun::RunnerValue;
use remorun::spawn_worker;
use tracing_subscriber::EnvFilter;

struct Calculator;

#[async_trait::async_trait]
impl Runner for Calculator {
    async fn execute(&self, method: &str, args: Vec<RunnerValue>) -> anyhow::Result<RunnerValue> {
        let numbers = args
            .into_iter()
            .map(|arg| arg.parse::<f64>())
            .collect::<Result<Vec<_>, _>>()?;
        let result: f64 = match method {
            "sum" => numbers.iter().sum(),
            "product" => numbers.iter().product(),
            other => anyhow::bail!("unknown method {}", other),
        };
        Ok(RunnerValue::json(result)?)
    }

    async fn destroy(&self) -> anyhow::Result<()> {
        tracing::info!("calculator destroyed");
        Ok(())
    }
}

fn calculator() -> RunnerDefinition {
    RunnerDefinition::new(&["sum", "product"], |_args: Vec<RunnerValue>| async { Ok(Calculator) })
}

async fn serve(port: remorun::Port) -> remorun::Result<()> {
    let host = RunnerResolverHost::builder(port).runner(calculator()).build()?;
    host.run().await?;
    host.closed().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("calc_worker=info".parse()?))
        .init();

    let (port, worker) = spawn_worker("calculator", |port| async move {
        if let Err(e) = serve(port).await {
            tracing::error!(error = %e, "calculator host failed");
        }
    })?;

    let client = RunnerResolverClient::builder(port).runner(calculator()).build()?;
    client.run().await?;
    tracing::info!(strategy = ?client.strategy(), "connected to worker");

    let calc = client.resolve(&calculator(), vec![]).await?;
    let sum: f64 = calc.call_json("sum", [1.5, 2.5, 3.0]).await?;
    let product: f64 = calc.call_json("product", [2.0, 3.0, 7.0]).await?;
    tracing::info!(sum, product, "computed in worker");

    client.destroy().await?;
    tokio::task::spawn_blocking(move || worker.join())
        .await?
        .map_err(|_| anyhow::anyhow!("worker panicked"))?;
    Ok(())
}
