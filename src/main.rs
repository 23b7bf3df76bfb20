use anyhow::{Context, Error, Result};
use camino::Utf8PathBuf;
use clap::Parser;
use std::fs;
use std::io::{self, Write};
use std::process::ExitCode;

use openvpn_exporter::export;
use openvpn_exporter::geo::{
    CachedResolver, DisabledResolver, GeoResolver, IpApiResolver, MmdbResolver, DEFAULT_API_URL,
};
use openvpn_exporter::input::FileOrStdin;
use openvpn_exporter::Exporter;

/// Check if the error chain contains a broken pipe error.
#[inline(always)]
fn is_broken_pipe(err: &Error) -> bool {
    // Look for a broken pipe error in the error chain
    for cause in err.chain() {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            if io_err.kind() == io::ErrorKind::BrokenPipe {
                return true;
            }
        }
    }
    false
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// OpenVPN server status file to scrape. Use "-" to read from stdin
    #[clap(value_name = "STATUS_FILE", value_hint = clap::ValueHint::FilePath)]
    status_file: Utf8PathBuf,

    /// Write the exposition to FILE (via a temp file and rename) instead
    /// of stdout, for textfile-collector setups
    #[clap(short, long, value_name = "FILE", value_hint = clap::ValueHint::FilePath)]
    output: Option<Utf8PathBuf>,

    /// Directory containing GeoLite2-City.mmdb; selects the offline MMDB
    /// geolocation backend instead of the HTTP one
    #[clap(
        short = 'I',
        long,
        value_name = "DIR",
        value_hint = clap::ValueHint::DirPath,
        env = "GEOIP_MMDB_DIR"
    )]
    mmdb_dir: Option<Utf8PathBuf>,

    /// Base URL of the ip-api.com style geolocation endpoint
    #[clap(long, value_name = "URL", default_value = DEFAULT_API_URL)]
    api_url: String,

    /// Address the server's own location is resolved from. The default
    /// empty address lets the HTTP backend report the caller's public IP
    #[clap(long, value_name = "ADDR", default_value = "")]
    public_ip: String,

    /// Disable geolocation entirely; geo labels stay empty and client
    /// distances are zero
    #[clap(long, conflicts_with_all = &["mmdb_dir", "api_url"])]
    offline: bool,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Use a separate run function to handle the actual work
    let err = match run_main() {
        Ok(code) => return code,
        Err(err) => err,
    };

    // Handle broken pipe errors gracefully
    if is_broken_pipe(&err) {
        return ExitCode::SUCCESS;
    }

    // Print detailed error information based on environment variables
    if std::env::var("RUST_BACKTRACE").is_ok_and(|v| v == "1")
        && std::env::var("RUST_LIB_BACKTRACE").map_or(true, |v| v == "1")
    {
        writeln!(&mut std::io::stderr(), "{:?}", err).unwrap();
    } else {
        writeln!(&mut std::io::stderr(), "{:#}", err).unwrap();
    }

    ExitCode::FAILURE
}

fn run_main() -> Result<ExitCode> {
    let args = Args::parse();

    let resolver: Box<dyn GeoResolver> = if args.offline {
        Box::new(DisabledResolver)
    } else if let Some(dir) = &args.mmdb_dir {
        Box::new(CachedResolver::new(MmdbResolver::open(dir)?))
    } else {
        Box::new(CachedResolver::new(IpApiResolver::new(
            args.api_url.as_str(),
        )?))
    };

    let exporter = Exporter::new(resolver, &args.public_ip);
    let source = FileOrStdin::from_path(args.status_file);
    let text = export::scrape_to_text(&exporter, &source)?;

    match &args.output {
        Some(path) => write_atomic(path, text.as_bytes())?,
        None => io::stdout().write_all(text.as_bytes())?,
    }

    Ok(ExitCode::SUCCESS)
}

/// Write the exposition through a temp file so scrapers of the output
/// file never observe a half-written exposition.
fn write_atomic(path: &Utf8PathBuf, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data).with_context(|| format!("failed to write {tmp}"))?;
    fs::rename(&tmp, path).with_context(|| format!("failed to move {tmp} into place"))?;
    Ok(())
}
