//! Translation server binary.
//!
//! The connection arrives as an inherited file descriptor whose ASCII
//! decimal number is the only positional argument; the guest-side client
//! spawns this process with the other end of the socket pair.
//!
//! ```bash
//! rejit-server 5 --pic --profile
//! ```

use std::os::{
    fd::{FromRawFd, OwnedFd},
    unix::net::UnixStream,
};

use clap::{Parser, ValueEnum};
use rejit_server::{DumpStages, ServerOptions, pipeline::basic::basic_pipeline, serve};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Pipeline stages that can dump IR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DumpStage {
    /// After lifting.
    Lift,
    /// After the calling-convention rewrite.
    Cc,
    /// After optimization.
    Opt,
    /// After code generation.
    Codegen,
}

/// Dynamic binary translation server
#[derive(Parser, Debug)]
#[command(name = "rejit-server")]
#[command(about = "JIT translation server for guest binaries")]
#[command(version)]
struct Args {
    /// Inherited socket file descriptor (ASCII decimal)
    fd: i32,

    /// Profile translation stages
    #[arg(long)]
    profile: bool,

    /// Trace execution (lots of logs)
    #[arg(long)]
    trace: bool,

    /// Perf support: 0 disabled, 1 memory map, 2 jitdump file
    #[arg(long, default_value_t = 0)]
    perf: u8,

    /// Compile code position-independent
    #[arg(long)]
    pic: bool,

    /// Disable the register-based calling convention
    #[arg(long)]
    no_fastcc: bool,

    /// Enable call-ret lifting
    #[arg(long)]
    callret: bool,

    /// Don't clobber flags on call/ret instructions
    #[arg(long)]
    safe_call_ret: bool,

    /// Verify lifted IR
    #[arg(long)]
    verify_lifted: bool,

    /// Dump IR after the given stages
    #[arg(long, value_enum)]
    dump_ir: Vec<DumpStage>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn options(&self) -> ServerOptions {
        let mut dump_ir = DumpStages::default();
        for stage in &self.dump_ir {
            match stage {
                DumpStage::Lift => dump_ir.lift = true,
                DumpStage::Cc => dump_ir.cc = true,
                DumpStage::Opt => dump_ir.opt = true,
                DumpStage::Codegen => dump_ir.codegen = true,
            }
        }
        ServerOptions {
            profile: self.profile,
            trace: self.trace,
            perf: self.perf,
            pic: self.pic,
            fastcc: !self.no_fastcc,
            callret: self.callret,
            safe_call_ret: self.safe_call_ret,
            verify_lifted: self.verify_lifted,
            dump_ir,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer().with_writer(std::io::stderr)).with(filter).init();

    tracing::info!(fd = args.fd, "translation server starting");

    // The descriptor was inherited from the spawning client; adopting it is
    // the ownership handover the process contract prescribes.
    #[allow(unsafe_code)]
    let owned = unsafe { OwnedFd::from_raw_fd(args.fd) };
    let stream = UnixStream::from(owned);

    let mut pipeline = basic_pipeline();
    serve(stream, &mut pipeline, args.options())?;

    tracing::info!("session finished");
    Ok(())
}
