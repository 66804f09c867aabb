use clap::{Arg, ArgAction, Command};
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use bdp::cas::Cas;
use bdp::collaborators::duplex::DuplexTransport;
use bdp::collaborators::local_fs::LocalFolder;
use bdp::config::Config;
use bdp::session::{NoopCallbacks, Session};
use bdp::store::Store;
use bdp::types::{ConflictStrategy, Direction, PairId, SyncPair};

fn bdp_dir(root: &std::path::Path) -> PathBuf {
	root.join(bdp::collaborators::local_fs::METADATA_DIR_NAME)
}

fn open_store_and_cas(root: &std::path::Path, config: &Config) -> Result<(Store, Cas), Box<dyn Error>> {
	let dir = bdp_dir(root);
	std::fs::create_dir_all(&dir)?;
	let store = Store::open(&dir.join("bdp.redb"))?;
	let cas = Cas::new(dir.join("cas"), config.compression_threshold, config.compression_ratio_cutoff);
	Ok((store, cas))
}

/// Two-way sync between two local directories over an in-process transport;
/// no networking involved (see `sync serve` for the remote case, not yet
/// implemented here).
async fn sync_local(dir_a: String, dir_b: String) -> Result<(), Box<dyn Error>> {
	let config = Config::default();
	let root_a = PathBuf::from(&dir_a);
	let root_b = PathBuf::from(&dir_b);

	let (store_a, cas_a) = open_store_and_cas(&root_a, &config)?;
	let (store_b, cas_b) = open_store_and_cas(&root_b, &config)?;

	let pair_id = PairId::generate();
	let device_a = bdp::types::DeviceId::generate();
	let device_b = bdp::types::DeviceId::generate();

	let pair = SyncPair {
		pair_id,
		devices: vec![device_a.clone(), device_b.clone()],
		direction: Direction::Bidirectional,
		conflict_strategy: ConflictStrategy::LastWriteWins,
		include_patterns: vec![],
		exclude_patterns: vec![],
		max_file_size_bytes: config.default_max_file_size_bytes,
		last_synced_at: None,
	};
	store_a.put_pair(&pair)?;
	store_b.put_pair(&pair)?;

	let (transport_a, transport_b) = DuplexTransport::pair();

	let session_a = Session::new(
		config.clone(),
		Arc::new(store_a),
		Arc::new(cas_a),
		pair.clone(),
		device_a,
		Arc::new(transport_a),
		Arc::new(LocalFolder::new(root_a.clone())),
		Arc::new(LocalFolder::new(root_a)),
		Arc::new(NoopCallbacks),
	);
	let session_b = Session::new(
		config,
		Arc::new(store_b),
		Arc::new(cas_b),
		pair,
		device_b,
		Arc::new(transport_b),
		Arc::new(LocalFolder::new(root_b.clone())),
		Arc::new(LocalFolder::new(root_b)),
		Arc::new(NoopCallbacks),
	);

	session_a.refresh_local_index(now_ms()).await?;
	session_b.refresh_local_index(now_ms()).await?;

	// One side sends HELLO and drives the exchange; the other only reacts.
	let a = tokio::spawn(async move { session_a.run().await });
	let b = tokio::spawn(async move { session_b.run_as_responder().await });

	let (a_result, b_result) = tokio::join!(a, b);
	a_result??;
	b_result??;
	Ok(())
}

fn now_ms() -> i64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.map(|d| d.as_millis() as i64)
		.unwrap_or(0)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
	bdp::logging::init_tracing();

	let matches = Command::new("bdp")
		.version("0.1.0")
		.about("Peer-to-peer folder sync")
		.subcommand_required(true)
		.subcommand(
			Command::new("sync")
				.about("Two-way sync between local directories")
				.arg(Arg::new("dir").required(true).action(ArgAction::Append).num_args(2)),
		)
		.get_matches();

	if let Some(sub_matches) = matches.subcommand_matches("sync") {
		let dirs: Vec<String> = sub_matches.get_many::<String>("dir").expect("clap enforces exactly 2").cloned().collect();
		sync_local(dirs[0].clone(), dirs[1].clone()).await?;
	}

	Ok(())
}

// vim: ts=4
