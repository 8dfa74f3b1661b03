#[macro_use]
extern crate tracing;

use std::env;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use kmsplash::backend::Card;
use kmsplash::cli::Cli;
use kmsplash::shutdown::{Idle, ShutdownToken};
use kmsplash::takeover::Takeover;
use kmsplash::utils::{daemon, signals};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Before anything else, so that no termination signal can be lost or kill us half-way.
    if let Err(err) = signals::block_early() {
        eprintln!("error blocking signals: {err:?}");
    }

    let directives = env::var("RUST_LOG").unwrap_or_else(|_| "kmsplash=debug,info".to_owned());
    let env_filter = EnvFilter::builder().parse_lossy(directives);
    tracing_subscriber::fmt()
        .compact()
        .with_writer(std::io::stderr)
        .with_env_filter(env_filter)
        .init();

    let cli = Cli::parse();

    let _client = tracy_client::Client::start();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:?}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    info!("starting version {}", kmsplash::utils::version());

    let card = Card::open(&cli.device)?;

    let mut image = cli.image_source();
    let mut takeover = Takeover::start(card, &mut image)?;
    drop(image);

    let active = takeover.active_outputs().count();
    if active == 0 {
        warn!("no display was taken over");
    }

    let token = ShutdownToken::new();
    // Pending signals are not inherited across fork(), so look for one from startup first.
    if let Some(signal) = signals::pending() {
        info!("quitting due to receiving signal {signal} during startup");
        token.request();
    }

    if !token.is_requested() {
        if cli.should_detach() {
            info!("detaching");
            daemon::detach().context("error detaching")?;
        }

        daemon::notify_ready();
    }

    let mut idle = Idle::new(token)?;
    signals::listen(&idle.handle())?;
    idle.wait(cli.trigger())?;

    if let Err(err) = takeover.restore() {
        warn!("error restoring displays: {err:?}");
    }

    Ok(())
}
