//! opsidecar server binary.
//!
//! Environment variables:
//!   OM_KEY            - operator login secret (auth disabled when empty)
//!   OM_SYS_NAME       - system name, run file derives from it
//!   GORIG_SYS_MODE    - run mode (dev/test/prod)
//!   OM_HOST / OM_PORT - listen address
//!   OM_DB_PATH        - SQLite path (default .cache/om.db)

use clap::Parser;
use opsidecar::{OmConfig, TrackingAlloc};
use tracing::info;

#[global_allocator]
static ALLOC: TrackingAlloc = TrackingAlloc::new();

#[derive(Parser, Debug)]
#[command(name = "opsidecar-server")]
#[command(about = "Operations and deployment sidecar")]
struct Args {
    /// Listen host
    #[arg(long, env = "OM_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Listen port
    #[arg(short, long, env = "OM_PORT", default_value = "8081")]
    port: u16,

    /// System name; the managed run file is <sys-name>-<mode>.linux64
    #[arg(long, env = "OM_SYS_NAME", default_value = "opsidecar")]
    sys_name: String,

    /// Run mode, exported to restarted children as GORIG_SYS_MODE
    #[arg(long, env = "GORIG_SYS_MODE", default_value = "dev")]
    run_mode: String,

    /// Operator login secret; auth rejects everything when empty
    #[arg(long, env = "OM_KEY", default_value = "")]
    om_key: String,

    /// SQLite database path
    #[arg(long, env = "OM_DB_PATH", default_value = ".cache/om.db")]
    db_path: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("opsidecar=debug".parse().unwrap())
                .add_directive("info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    info!("Starting opsidecar");
    info!("  System: {}-{}", args.sys_name, args.run_mode);
    info!("  Listen: {}:{}", args.host, args.port);

    let config = OmConfig {
        sys_name: args.sys_name,
        run_mode: args.run_mode,
        host: args.host,
        port: args.port,
        om_key: args.om_key,
        db_path: args.db_path.into(),
        ..OmConfig::default()
    };

    opsidecar::run_server(config).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_default_values() {
        let args = Args::parse_from(["opsidecar-server"]);
        assert_eq!(args.host, "0.0.0.0");
        assert_eq!(args.port, 8081);
        assert_eq!(args.sys_name, "opsidecar");
        assert_eq!(args.run_mode, "dev");
        assert_eq!(args.db_path, ".cache/om.db");
    }

    #[test]
    fn test_args_custom_port_short() {
        let args = Args::parse_from(["opsidecar-server", "-p", "9090"]);
        assert_eq!(args.port, 9090);
    }

    #[test]
    fn test_args_custom_identity() {
        let args = Args::parse_from([
            "opsidecar-server",
            "--sys-name",
            "billing_api",
            "--run-mode",
            "prod",
        ]);
        assert_eq!(args.sys_name, "billing_api");
        assert_eq!(args.run_mode, "prod");
    }
}
