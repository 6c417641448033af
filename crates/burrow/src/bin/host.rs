use std::sync::Arc;

use burrow::{cli::HostArgs, conf, log, web};
use burrow_bridge::inbound::{HttpFrontend, Resource, Router};
use burrow_core::{AppContext, listener::TcpEndpoint};
use clap::Parser as _;
use tracing::{Level, info};

#[tokio::main]
async fn main() -> eyre::Result<()> {
	log::init_log(Level::INFO)?;
	let args = match HostArgs::try_parse() {
		Ok(args) => args,
		Err(err) => {
			println!("{err}");
			return Ok(());
		}
	};

	if args.sha256gen.as_deref() == Some("1") {
		let (Some(auth), Some(salt)) = (&args.auth, &args.salt) else {
			println!("--auth or --salt missing");
			return Ok(());
		};
		println!("{}\n", conf::sha256_hex(auth, salt));
		return Ok(());
	}

	conf::validate_port(args.tcp_port)?;
	conf::validate_port(args.http_port)?;
	eyre::ensure!(args.tcp_port != args.http_port, "TCP and HTTP port can't be the same");

	let configs = conf::load_resources(&args.config)?;
	eyre::ensure!(
		!configs.is_empty(),
		"no resources configured in {}",
		args.config.display()
	);

	let ctx = Arc::new(AppContext::default());
	let resources: Vec<Arc<Resource>> = configs
		.into_iter()
		.map(|config| Resource::new(config, ctx.clone()))
		.collect();
	let router = Router::new(resources.clone());
	let frontend = HttpFrontend::new(resources);

	let bridge_router = router.clone();
	let bridge = TcpEndpoint::bind(([0, 0, 0, 0], args.tcp_port).into(), &ctx, move |stream| {
		let router = bridge_router.clone();
		async move {
			router.handle(stream).await;
		}
	})
	.await?;

	let front = frontend.clone();
	let http = TcpEndpoint::bind(([0, 0, 0, 0], args.http_port).into(), &ctx, move |stream| {
		let frontend = front.clone();
		async move {
			frontend.handle(stream).await;
		}
	})
	.await?;

	let web = match args.web_port {
		Some(web_port) => {
			conf::validate_port(web_port)?;
			Some(web::serve(web_port, router.clone(), &ctx).await?)
		}
		None => {
			info!(target: "[MAIN]", "authorization endpoint disabled (no --webPort)");
			None
		}
	};

	info!(
		target: "[MAIN]",
		"tunnel host started: bridge on {}, http front-end on {}",
		bridge.local_addr(),
		http.local_addr()
	);

	tokio::signal::ctrl_c().await?;
	info!(target: "[MAIN]", "shutting down");
	bridge.stop();
	http.stop();
	if let Some(web) = &web {
		web.stop();
	}
	ctx.shutdown().await;

	Ok(())
}
