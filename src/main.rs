//! Entry point (§4.22): configuration → handshake → dispatcher → mount →
//! graceful teardown.

use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use clap::Parser;
use fuser::MountOption;
use log::{error, info};

use netpipefs::config::Options;
use netpipefs::context::Context;
use netpipefs::dispatcher::Dispatcher;
use netpipefs::fs::NetPipeFs;
use netpipefs::handshake;

fn init_logging(opts: &Options) {
    let default_level = if opts.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
}

fn main() -> ExitCode {
    let opts = Options::parse();
    init_logging(&opts);

    let channel = match handshake::perform(&opts) {
        Ok(channel) => channel,
        Err(e) => {
            error!("handshake failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mountpoint = opts.mountpoint.clone();
    let ctx = Arc::new(Context::new(channel, opts));

    let dispatcher = Dispatcher::new(ctx.clone());
    let stop_handle = dispatcher.stop_handle();
    let dispatcher_thread = thread::spawn(move || dispatcher.run());

    let mount_options = vec![MountOption::FSName("netpipefs".to_string())];

    info!("mounting at {}", mountpoint.display());
    let mount_result = fuser::mount2(NetPipeFs::new(ctx), &mountpoint, &mount_options);

    stop_handle.stop();
    if dispatcher_thread.join().is_err() {
        error!("dispatcher thread panicked");
    }

    match mount_result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("mount failed: {e}");
            ExitCode::FAILURE
        }
    }
}
