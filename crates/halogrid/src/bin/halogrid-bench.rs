//! Halo-exchange smoke and timing driver.
//!
//! Runs a configurable number of exchange rounds over the host backend
//! (or CUDA with `--features cuda`), with flags mapping 1:1 onto the
//! method bitmask and placement strategy.

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;

use halogrid::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "halogrid-bench", about = "halo exchange timing driver")]
struct Args {
    /// Global extent along x.
    #[arg(short = 'x', long, default_value_t = 64)]
    x: i64,
    /// Global extent along y.
    #[arg(short = 'y', long, default_value_t = 64)]
    y: i64,
    /// Global extent along z.
    #[arg(short = 'z', long, default_value_t = 64)]
    z: i64,
    /// Stencil radius.
    #[arg(long, default_value_t = 1)]
    radius: i64,
    /// Exchange rounds to run.
    #[arg(long, default_value_t = 10)]
    iters: usize,
    /// Simulated devices on the host backend.
    #[arg(long, default_value_t = 1)]
    devices: usize,

    /// Enable only the same-rank bounce-copy method.
    #[arg(long)]
    copy: bool,
    /// Enable only the same-rank peer-copy method.
    #[arg(long)]
    peer: bool,
    /// Enable only the peer translate-kernel method.
    #[arg(long)]
    kernel: bool,
    /// Enable only colocated staged messaging.
    #[arg(long)]
    colocated: bool,
    /// Enable only remote staged messaging.
    #[arg(long)]
    remote: bool,
    /// Enable only device-aware remote messaging.
    #[arg(long)]
    device_aware: bool,

    /// Use trivial placement instead of node-aware.
    #[arg(long)]
    trivial: bool,
}

fn methods_from(args: &Args) -> Methods {
    let mut m = Methods::empty();
    if args.copy {
        m |= Methods::SAME_RANK_COPY;
    }
    if args.peer {
        m |= Methods::SAME_RANK_PEER;
    }
    if args.kernel {
        m |= Methods::KERNEL_PEER;
    }
    if args.colocated {
        m |= Methods::COLOCATED_STAGED;
    }
    if args.remote {
        m |= Methods::REMOTE_STAGED;
    }
    if args.device_aware {
        m |= Methods::DEVICE_AWARE_REMOTE;
    }
    // Empty means everything stays enabled.
    m
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let group = LocalGroup::new(1);
    let platform = Arc::new(HostPlatform::new(args.devices));

    let placement = if args.trivial {
        Placement::Trivial
    } else {
        Placement::NodeAware
    };

    let mut grid = GridBuilder::new(args.x, args.y, args.z)
        .radius(args.radius)
        .methods(methods_from(&args))
        .placement(placement)
        .field(4, "pressure")
        .build(Arc::new(group.communicator(0)), platform)?;

    let cells: i64 = grid.domains().iter().map(|d| d.size().flatten()).sum();
    tracing::info!(
        domains = grid.domains().len(),
        cells,
        "realized; starting {} exchange rounds",
        args.iters
    );

    let start = Instant::now();
    for i in 0..args.iters {
        let round = Instant::now();
        grid.exchange()?;
        grid.swap();
        tracing::debug!(iter = i, elapsed_us = round.elapsed().as_micros() as u64, "round");
    }
    let elapsed = start.elapsed();
    tracing::info!(
        iters = args.iters,
        total_ms = elapsed.as_millis() as u64,
        per_iter_us = (elapsed.as_micros() / args.iters.max(1) as u128) as u64,
        "done"
    );
    Ok(())
}
