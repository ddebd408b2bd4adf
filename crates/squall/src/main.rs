use std::sync::Arc;

use clap::Parser as _;
use tokio::task::JoinSet;
use tracing::Level;
use squall_core::{AppContext, info, transport::{AbstractTransport, TcpTransport}};
use squall_session::{
	Dispatcher, ForwardSpec, Session, SessionOpts, accept_session, forward, open_session,
	request_foreground, request_remote_forward, socks,
};

use crate::{
	cli::{Cli, Commands, EndpointArgs},
	conf::{persistent::PersistentConfig, runtime::Config},
	runner::ExecRunner,
};

mod cli;
mod conf;
mod log;
mod runner;

#[tokio::main]
async fn main() -> eyre::Result<()> {
	log::init_log(Level::DEBUG)?;
	let cli = match Cli::try_parse() {
		Ok(v) => v,
		Err(err) => {
			println!("{:#}", err);
			return Ok(());
		}
	};

	if cli.version {
		const VER: &str = match option_env!("SQUALL_OVERRIDE_VERSION") {
			Some(v) => v,
			None => env!("CARGO_PKG_VERSION"),
		};
		println!("squall {VER}");
		return Ok(());
	}

	let mut persist = PersistentConfig::load(cli.config.clone(), cli.config_dir.clone())?;
	let Some(command) = cli.command else {
		println!("nothing to do; try `squall master --help` or `squall slave --help`");
		return Ok(());
	};

	match command {
		Commands::Init { format } => {
			let format = format!("{format:?}").to_lowercase();
			let path = std::path::PathBuf::from(format!("config.{}", if format == "yaml" { "yaml" } else { "toml" }));
			PersistentConfig::default().export_to_file(&path, &format)?;
			info!(target: "[MAIN]", "wrote default config to {}", path.display());
			Ok(())
		}
		Commands::Master {
			endpoint,
			socks,
			local_forwards,
			remote_forwards,
			exec,
			pty,
		} => {
			if socks.is_some() {
				persist.master.socks = socks;
			}
			if !local_forwards.is_empty() {
				persist.master.local_forwards = local_forwards;
			}
			if !remote_forwards.is_empty() {
				persist.master.remote_forwards = remote_forwards;
			}
			if exec.is_some() {
				persist.master.exec = exec;
			}
			persist.master.pty |= pty;
			run_master(endpoint, persist).await
		}
		Commands::Slave { endpoint } => run_slave(endpoint, persist).await,
	}
}

/// Produce the one connection this process runs its session over.
async fn establish(endpoint: &EndpointArgs, opts: SessionOpts) -> eyre::Result<Session> {
	if let Some(addr) = &endpoint.connect {
		let transport = TcpTransport { addr: addr.clone() };
		let (stream, label) = transport.dial().await?;
		info!(target: "[MAIN]", "connected to {label}");
		Ok(open_session(stream, label, opts).await?)
	} else if let Some(addr) = &endpoint.listen {
		let transport = TcpTransport { addr: addr.clone() };
		let listener = transport.bind().await?;
		info!(target: "[MAIN]", "listening on {}", listener.local_addr()?);
		let (stream, peer) = listener.accept().await?;
		stream.set_nodelay(true)?;
		info!(target: "[MAIN]", "connection from {peer}");
		Ok(accept_session(stream, peer.to_string(), opts).await?)
	} else {
		eyre::bail!("either --listen or --connect is required")
	}
}

async fn run_master(endpoint: EndpointArgs, persist: PersistentConfig) -> eyre::Result<()> {
	let config = Config::from_persist(&persist);
	let ctx = Arc::new(AppContext::default());
	let session = Arc::new(establish(&endpoint, config.session_opts).await?);
	let udp_timeout = config.dispatcher_opts.udp_timeout;

	let dispatcher = Dispatcher::new(session.clone(), Arc::new(ExecRunner), config.dispatcher_opts);
	let mut established = dispatcher.subscribe_established();
	let mut set: JoinSet<eyre::Result<()>> = JoinSet::new();
	set.spawn(async move {
		dispatcher.run().await?;
		Ok(())
	});

	// Hold user-facing surfaces until the identity exchange is done, so no
	// control message can overtake our own Hello.
	if established.changed().await.is_err() {
		eyre::bail!("session ended during handshake");
	}

	for rule in &persist.master.local_forwards {
		let spec = ForwardSpec {
			protocol: rule.protocol(),
			local:    rule.local.clone(),
			remote:   rule.remote.clone(),
		};
		let session = session.clone();
		let cancel = session.token().child_token();
		set.spawn(async move { forward::run_forward_listener(session, spec, udp_timeout, cancel).await });
	}
	for rule in &persist.master.remote_forwards {
		request_remote_forward(&session, &ForwardSpec {
			protocol: rule.protocol(),
			local:    rule.local.clone(),
			remote:   rule.remote.clone(),
		})
		.await?;
	}
	if let Some(listen) = persist.master.socks.clone() {
		let session = session.clone();
		let cancel = session.token().child_token();
		set.spawn(async move { socks::run_socks_server(session, listen, cancel).await });
	}

	let wants_foreground = persist.master.exec.is_some()
		|| (persist.master.socks.is_none()
			&& persist.master.local_forwards.is_empty()
			&& persist.master.remote_forwards.is_empty());
	if wants_foreground {
		let exec = persist.master.exec.clone().unwrap_or_default();
		let resize_rx = if persist.master.pty {
			let (tx, rx) = tokio::sync::mpsc::channel(4);
			// Terminal resize signalling is a platform helper squall does
			// not carry; announce a conventional initial size.
			let _ = tx.send((24, 80)).await;
			// Keep the sender alive with the session.
			ctx.tasks.spawn({
				let token = ctx.token.clone();
				async move {
					token.cancelled().await;
					drop(tx);
				}
			});
			Some(rx)
		} else {
			None
		};
		let session = session.clone();
		let cancel = session.token().child_token();
		set.spawn(async move {
			request_foreground(&session, &exec, runner::StdioStream::new(), resize_rx, cancel).await?;
			Ok(())
		});
	}

	serve_until_done(ctx, session, set).await
}

async fn run_slave(endpoint: EndpointArgs, persist: PersistentConfig) -> eyre::Result<()> {
	let config = Config::from_persist(&persist);
	let ctx = Arc::new(AppContext::default());
	let session = Arc::new(establish(&endpoint, config.session_opts).await?);

	let dispatcher = Dispatcher::new(session.clone(), Arc::new(ExecRunner), config.dispatcher_opts);
	let mut set: JoinSet<eyre::Result<()>> = JoinSet::new();
	set.spawn(async move {
		dispatcher.run().await?;
		Ok(())
	});

	serve_until_done(ctx, session, set).await
}

/// Run until the session ends or the user interrupts; close everything
/// exactly once either way.
async fn serve_until_done(
	ctx: Arc<AppContext>,
	session: Arc<Session>,
	mut set: JoinSet<eyre::Result<()>>,
) -> eyre::Result<()> {
	let result = tokio::select! {
		_ = tokio::signal::ctrl_c() => {
			info!(target: "[MAIN]", "interrupted, shutting down");
			Ok(())
		}
		joined = set.join_next() => match joined {
			Some(Ok(res)) => res,
			Some(Err(err)) => Err(eyre::eyre!("task failed: {err}")),
			None => Ok(()),
		}
	};
	session.close().await;
	ctx.shutdown().await;
	set.shutdown().await;
	result
}
