use anyhow::{Context, Result, bail};
use clap::Parser;
use pflash_core::eligibility::{self, Eligibility};
use pflash_core::hex::HexReader;
use pflash_core::link::{GattLink, MockLink};
use pflash_core::session::{FlashSession, Outcome, SessionConfig};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "micro:bit partial flashing tool", long_about = None)]
struct Args {
    /// Path to the firmware image (Intel HEX)
    image: String,

    /// Path to a TOML session configuration file
    #[arg(long)]
    config: Option<String>,

    /// Device address, carried into the session configuration
    #[arg(long)]
    device: Option<String>,

    /// Device region hash (16 hex characters) to check eligibility
    /// against; read it from the device's memory map characteristic
    #[arg(long)]
    device_hash: Option<String>,

    /// Run the full protocol against a simulated device instead of a
    /// live link. The simulated device reports the image's own template
    /// hash unless --device-hash overrides it
    #[arg(long)]
    dry_run: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    match run(args) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn run(args: Args) -> Result<i32> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("loading config from {path}"))?,
        None => SessionConfig::default(),
    };
    config.image_path = args.image.clone();
    if args.device.is_some() {
        config.device_address = args.device.clone();
    }
    info!(
        device = config.device_address.as_deref().unwrap_or("none"),
        timeout_ms = config.response_timeout_ms,
        pacing_ms = config.pacing_delay_ms,
        "Session configuration"
    );

    let mut hex = HexReader::open(&args.image)?;
    let metadata = hex
        .read_metadata()
        .context("image carries no partial flashing metadata; it needs a full flash")?;
    let total_lines = HexReader::count_lines(&args.image)?;

    info!(
        template = %metadata.template_hash,
        program = %metadata.program_hash,
        marker = %format!("0x{:08X}", metadata.marker_address),
        lines = total_lines,
        "Image inspected"
    );

    if args.dry_run {
        let region_hash = args
            .device_hash
            .as_deref()
            .unwrap_or(&metadata.template_hash);
        let link = simulated_link(region_hash)?;
        return run_session(config, link);
    }

    if let Some(device_hash) = &args.device_hash {
        match eligibility::check(&metadata.template_hash, device_hash) {
            Eligibility::Eligible => {
                info!("Image is eligible for partial flashing on this device");
            }
            Eligibility::NotEligible => {
                bail!(
                    "image template {} does not match device hash {}; a full flash is required",
                    metadata.template_hash,
                    device_hash
                );
            }
        }
    }

    Ok(0)
}

/// Scripted link standing in for a device whose DAL region reports
/// `region_hash`.
fn simulated_link(region_hash: &str) -> Result<MockLink> {
    let hash_bytes = decode_hash(region_hash)?;

    // Plausible DAL bounds for a simulated catalog.
    let mut addressing = [0u8; 12];
    addressing[0..4].copy_from_slice(&0x0001_8000u32.to_le_bytes());
    addressing[8..12].copy_from_slice(&0x0003_B000u32.to_le_bytes());

    let mut link = MockLink::new();
    link.queue_read(b"DAL ");
    link.queue_read(&addressing);
    link.queue_read(&hash_bytes);
    Ok(link)
}

/// Run one session and map its outcome to an exit status.
fn run_session<L: GattLink + 'static>(config: SessionConfig, link: L) -> Result<i32> {
    let session = FlashSession::new(config, link);
    match session.run()? {
        Outcome::Succeeded(stats) => {
            info!(
                lines = stats.lines_flashed,
                packets = stats.packets_sent,
                retransmits = stats.retransmits,
                "Partial flash complete"
            );
            Ok(0)
        }
        Outcome::FallingBack { reason, .. } => {
            warn!(reason = %reason, "Partial update unavailable, full flash required");
            Ok(2)
        }
        Outcome::Failed(message) => {
            error!(message = %message, "Flash failed");
            Ok(1)
        }
    }
}

fn decode_hash(hash: &str) -> Result<Vec<u8>> {
    if hash.len() != 16 {
        bail!("device hash must be 16 hex characters, got {}", hash.len());
    }
    hash.as_bytes()
        .chunks(2)
        .map(|pair| {
            let text = std::str::from_utf8(pair)?;
            u8::from_str_radix(text, 16).with_context(|| format!("invalid hex pair {text:?}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::path::PathBuf;

    fn record_line(address: u16, type_code: u8, data: &str) -> String {
        format!(":{:02X}{:04X}{:02X}{}FF", data.len() / 2, address, type_code, data)
    }

    fn write_image(tag: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("pflash-cli-{}-{}.hex", std::process::id(), tag));
        let lines = vec![
            record_line(0x0000, 0, "708E3B92C615A841C49866C975EE5197"),
            record_line(0x0010, 0, "AAAAAAAAAAAAAAAA9999999999999999"),
            record_line(0x0020, 0, "00112233445566778899AABBCCDDEEFF"),
            record_line(0x0000, 1, ""),
        ];
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(lines.join("\n").as_bytes()).unwrap();
        path
    }

    fn config(image: &PathBuf) -> SessionConfig {
        SessionConfig {
            image_path: image.display().to_string(),
            response_timeout_ms: 200,
            pacing_delay_ms: 0,
            ..SessionConfig::default()
        }
    }

    #[test]
    fn matching_simulated_device_exits_zero() {
        let image = write_image("match");
        let link = simulated_link("AAAAAAAAAAAAAAAA").unwrap();
        assert_eq!(run_session(config(&image), link).unwrap(), 0);
        std::fs::remove_file(&image).ok();
    }

    #[test]
    fn mismatched_simulated_device_exits_with_fallback_status() {
        let image = write_image("mismatch");
        let link = simulated_link("BBBBBBBBBBBBBBBB").unwrap();
        assert_eq!(run_session(config(&image), link).unwrap(), 2);
        std::fs::remove_file(&image).ok();
    }

    #[test]
    fn decode_hash_rejects_bad_input() {
        assert_eq!(decode_hash("AAAAAAAAAAAAAAAA").unwrap(), vec![0xAA; 8]);
        assert!(decode_hash("AAAA").is_err());
        assert!(decode_hash("GGGGGGGGGGGGGGGG").is_err());
    }
}
