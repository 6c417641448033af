use std::{sync::Arc, time::Duration};

use burrow::{cli::ClientArgs, log};
use burrow_bridge::outbound::Tunnel;
use burrow_core::AppContext;
use clap::Parser as _;
use tracing::{Level, info};

#[tokio::main]
async fn main() -> eyre::Result<()> {
	log::init_log(Level::INFO)?;
	let args = match ClientArgs::try_parse() {
		Ok(args) => args,
		Err(err) => {
			println!("{err}");
			return Ok(());
		}
	};
	let opts = args.tunnel_opts()?;

	let ctx = Arc::new(AppContext::default());
	let tunnel = Tunnel::new(opts, ctx.clone());

	let outcome = tokio::select! {
		outcome = tunnel.clone().run() => outcome,
		_ = tokio::signal::ctrl_c() => {
			info!(target: "[MAIN]", "shutting down");
			Ok(())
		}
	};

	ctx.token.cancel();
	ctx.tasks.close();
	let _ = tokio::time::timeout(Duration::from_secs(5), ctx.tasks.wait()).await;

	outcome?;
	Ok(())
}
