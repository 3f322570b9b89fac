//! quotebot - two-sided quoting agent
//!
//! Wires the three long-lived pieces together: the book feed observer, the
//! gate session and the quoting engine, then supervises them until one dies
//! or the operator interrupts. Exit code is non-zero on any fatal path.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use dotenv::dotenv;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quotebot::config::Config;
use quotebot::engine::{EngineConfig, QuotingEngine, QUOTE_DEPTH};
use quotebot::gate::{GateConfig, OrderGateway, TradingChannel};
use quotebot::market::MarketObserver;

#[tokio::main]
async fn main() {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::parse();
    let code = match run(config).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "fatal");
            1
        }
    };
    std::process::exit(code);
}

async fn run(config: Config) -> Result<i32> {
    config.validate()?;
    info!(
        instrument = config.instrument,
        volume = config.volume,
        maxposition = config.maxposition,
        firstreq = config.firstreq,
        "starting quotebot"
    );

    let channel = TradingChannel::connect(&GateConfig {
        host: config.gate_host.clone(),
        port: config.gate_port,
        login: config.login,
        account: config.account,
        instrument: config.instrument,
        firstreq: config.firstreq,
    })
    .await?;

    let (engine, mut engine_task) = QuotingEngine::spawn(
        channel.clone() as Arc<dyn OrderGateway>,
        EngineConfig {
            volume: config.volume,
            position: config.position,
            maxposition: config.maxposition,
            interest: config.interest,
            shift: config.shift,
            increment: config.increment,
            floodlimit: config.floodlimit,
        },
    );
    channel.set_handler(engine.clone());

    let observer = MarketObserver::new(config.feed_url.clone(), config.instrument);
    observer.set_listener(engine.clone(), QUOTE_DEPTH);
    let mut feed_task = tokio::spawn(observer.run());

    let code = tokio::select! {
        code = &mut engine_task => code.unwrap_or(1),
        result = &mut feed_task => {
            match result {
                Ok(Err(e)) => error!(error = %e, "book feed failed"),
                Ok(Ok(())) => error!("book feed ended"),
                Err(e) => error!(error = %e, "book feed task panicked"),
            }
            engine.shutdown();
            engine_task.await.unwrap_or(1).max(1)
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, cancelling quotes");
            engine.shutdown();
            engine_task.await.unwrap_or(1)
        }
    };

    // Give the writer a beat to flush the shutdown mass cancel.
    tokio::time::sleep(Duration::from_millis(100)).await;
    channel.close();
    Ok(code)
}
