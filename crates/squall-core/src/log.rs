//! Thin wrappers over `tracing` that prefix the calling crate's package name
//! into the target, so `squall-session [FWD]` and `squall-socks [UDP]` lines
//! are distinguishable without configuring per-module filters.

#[macro_export]
macro_rules! info {
	(target: $target:expr, $($arg:tt)*) => {
		tracing::info!(target: concat!(env!("CARGO_PKG_NAME"), " ", $target), $($arg)*)
	};
	($($arg:tt)*) => {
		tracing::info!($($arg)*)
	};
}

#[macro_export]
macro_rules! warn {
	(target: $target:expr, $($arg:tt)*) => {
		tracing::warn!(target: concat!(env!("CARGO_PKG_NAME"), " ", $target), $($arg)*)
	};
	($($arg:tt)*) => {
		tracing::warn!($($arg)*)
	};
}

#[macro_export]
macro_rules! error {
	(target: $target:expr, $($arg:tt)*) => {
		tracing::error!(target: concat!(env!("CARGO_PKG_NAME"), " ", $target), $($arg)*)
	};
	($($arg:tt)*) => {
		tracing::error!($($arg)*)
	};
}

#[macro_export]
macro_rules! debug {
	(target: $target:expr, $($arg:tt)*) => {
		tracing::debug!(target: concat!(env!("CARGO_PKG_NAME"), " ", $target), $($arg)*)
	};
	($($arg:tt)*) => {
		tracing::debug!($($arg)*)
	};
}
