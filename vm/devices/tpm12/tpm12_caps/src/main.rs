// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A tool that reports the capability state of a TPM 1.2: its permanent and
//! volatile flags, PCR count, manufacturer and version.

use anyhow::Context;
use clap::Parser;
use serde_json::json;
use std::path::PathBuf;
use tpm12_lib::Tpm12CommandHelper;
use tpm12_lib::Tpm12Transport;
use tpm12_lib::VersionInfo;
use tpm12_lib::simulator::Tpm12SimulatorConfig;
use tpm12_lib::transport::DEFAULT_MSSIM_PORT;
use tpm12_lib::transport::DEFAULT_MSSIM_TIMEOUT_MS;
use tpm12_lib::transport::Tpm12TransportConfig;
use tpm12_lib::transport::open_transport;
use tpm12_protocol::tpm12proto::PermanentFlags;
use tpm12_protocol::tpm12proto::StClearFlags;

#[derive(Parser, Debug)]
#[clap(name = "tpm12_caps", about = "Tool to query TPM 1.2 capability state.")]
struct CmdArgs {
    /// Enable verbose logging (trace level)
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Read the transport configuration from a JSON file. Example: ./tpm12_caps --config tpm.json
    #[arg(
        long,
        value_name = "path-to-config-json",
        conflicts_with_all = ["device", "mssim", "simulator"]
    )]
    config: Option<PathBuf>,

    /// Use a TPM character device. Example: ./tpm12_caps --device /dev/tpm0
    #[arg(
        long,
        value_name = "path-to-device",
        conflicts_with_all = ["mssim", "simulator"]
    )]
    device: Option<PathBuf>,

    /// Connect to a TPM simulator. Example: ./tpm12_caps --mssim localhost:2321
    #[arg(
        long,
        value_name = "host:port",
        value_parser = parse_mssim_addr,
        conflicts_with = "simulator"
    )]
    mssim: Option<MssimAddr>,

    /// Query the in-process simulator instead of a device
    #[arg(long)]
    simulator: bool,

    /// Query the permanent flags
    #[arg(long)]
    permanent: bool,

    /// Query the volatile (ST_CLEAR) flags
    #[arg(long)]
    volatile: bool,

    /// Query the PCR count, manufacturer and version
    #[arg(long)]
    properties: bool,

    /// Print the results as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MssimAddr {
    host: String,
    port: u16,
}

/// Parse `host[:port]` or `[ipv6][:port]`.
fn parse_mssim_addr(value: &str) -> Result<MssimAddr, String> {
    let (host, port) = if let Some(bracketed) = value.strip_prefix('[') {
        // IPv6 literal: `[host]` or `[host]:port`.
        let (host, rest) = bracketed
            .split_once(']')
            .ok_or_else(|| format!("missing ']' in '{value}'"))?;
        let port = match rest {
            "" => None,
            rest => Some(
                rest.strip_prefix(':')
                    .ok_or_else(|| format!("expected ':' after ']' in '{value}'"))?,
            ),
        };
        (host, port)
    } else {
        match value.split_once(':') {
            Some((_, port)) if port.contains(':') => {
                return Err(format!(
                    "IPv6 address '{value}' must be enclosed in brackets, e.g. '[{value}]'"
                ));
            }
            Some((host, port)) => (host, Some(port)),
            None => (value, None),
        }
    };

    let port = match port {
        Some(port) => port
            .parse::<u16>()
            .map_err(|_| format!("invalid port number: {port}"))?,
        None => DEFAULT_MSSIM_PORT,
    };

    if host.is_empty() {
        return Err(format!("missing host in '{value}'"));
    }

    Ok(MssimAddr {
        host: host.to_string(),
        port,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Queries {
    permanent: bool,
    volatile: bool,
    properties: bool,
}

impl CmdArgs {
    /// The requested queries. Without any query flag, everything is queried.
    fn queries(&self) -> Queries {
        if !(self.permanent || self.volatile || self.properties) {
            return Queries {
                permanent: true,
                volatile: true,
                properties: true,
            };
        }

        Queries {
            permanent: self.permanent,
            volatile: self.volatile,
            properties: self.properties,
        }
    }

    fn transport_config(&self) -> anyhow::Result<Tpm12TransportConfig> {
        if let Some(path) = &self.config {
            let contents = fs_err::read_to_string(path)?;
            return serde_json::from_str(&contents)
                .with_context(|| format!("failed to parse transport config {}", path.display()));
        }

        let config = if let Some(path) = &self.device {
            Tpm12TransportConfig::Device { path: path.clone() }
        } else if let Some(addr) = &self.mssim {
            Tpm12TransportConfig::Mssim {
                host: addr.host.clone(),
                port: addr.port,
                timeout_ms: DEFAULT_MSSIM_TIMEOUT_MS,
            }
        } else if self.simulator {
            Tpm12TransportConfig::Simulator(Tpm12SimulatorConfig::default())
        } else {
            Tpm12TransportConfig::default()
        };

        Ok(config)
    }
}

#[derive(Debug)]
struct Properties {
    pcr_count: u32,
    manufacturer: u32,
    version: VersionInfo,
}

#[derive(Debug, Default)]
struct Report {
    permanent: Option<PermanentFlags>,
    volatile: Option<StClearFlags>,
    properties: Option<Properties>,
}

fn query<T: Tpm12Transport>(
    helper: &mut Tpm12CommandHelper<T>,
    queries: Queries,
) -> anyhow::Result<Report> {
    let mut report = Report::default();

    if queries.permanent {
        report.permanent = Some(
            helper
                .get_capability_flag_permanent()
                .context("failed to read permanent flags")?,
        );
    }

    if queries.volatile {
        report.volatile = Some(
            helper
                .get_capability_flag_volatile()
                .context("failed to read volatile flags")?,
        );
    }

    if queries.properties {
        report.properties = Some(Properties {
            pcr_count: helper
                .get_capability_pcr_count()
                .context("failed to read PCR count")?,
            manufacturer: helper
                .get_capability_manufacturer()
                .context("failed to read manufacturer")?,
            version: helper
                .get_capability_version_info()
                .context("failed to read version info")?,
        });
    }

    Ok(report)
}

/// Render a four-byte vendor ID, dropping trailing NULs.
fn vendor_id_string(id: [u8; 4]) -> String {
    let len = id.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    id[..len]
        .iter()
        .map(|b| {
            if (0x20..=0x7e).contains(b) {
                *b as char
            } else {
                '.'
            }
        })
        .collect()
}

fn flags_json(flags: &[(&'static str, bool)]) -> serde_json::Value {
    serde_json::Value::Object(
        flags
            .iter()
            .map(|(name, set)| (name.to_string(), (*set).into()))
            .collect(),
    )
}

impl Report {
    fn to_json(&self) -> serde_json::Value {
        let mut report = serde_json::Map::new();

        if let Some(flags) = &self.permanent {
            report.insert("permanent_flags".into(), flags_json(&flags.flags()));
        }

        if let Some(flags) = &self.volatile {
            report.insert("volatile_flags".into(), flags_json(&flags.flags()));
        }

        if let Some(properties) = &self.properties {
            let info = &properties.version.info;
            report.insert(
                "properties".into(),
                json!({
                    "pcr_count": properties.pcr_count,
                    "manufacturer": vendor_id_string(properties.manufacturer.to_be_bytes()),
                    "manufacturer_id": properties.manufacturer,
                    "version": {
                        "major": info.version.major,
                        "minor": info.version.minor,
                        "rev_major": info.version.rev_major,
                        "rev_minor": info.version.rev_minor,
                        "spec_level": info.spec_level.get(),
                        "errata_rev": info.errata_rev,
                        "vendor_id": vendor_id_string(info.tpm_vendor_id),
                        "vendor_specific": properties
                            .version
                            .vendor_specific
                            .iter()
                            .map(|b| format!("{b:02x}"))
                            .collect::<String>(),
                    },
                }),
            );
        }

        serde_json::Value::Object(report)
    }

    fn print(&self) {
        if let Some(flags) = &self.permanent {
            print_flags("Permanent flags", flags.tag.get(), &flags.flags());
        }

        if let Some(flags) = &self.volatile {
            print_flags("Volatile flags", flags.tag.get(), &flags.flags());
        }

        if let Some(properties) = &self.properties {
            let info = &properties.version.info;
            println!("Properties");
            println!("  PCR count:     {}", properties.pcr_count);
            println!(
                "  Manufacturer:  {} ({:#010x})",
                vendor_id_string(properties.manufacturer.to_be_bytes()),
                properties.manufacturer
            );
            println!(
                "  Version:       {}.{}.{}.{}",
                info.version.major,
                info.version.minor,
                info.version.rev_major,
                info.version.rev_minor
            );
            println!(
                "  Spec level:    {} errata {}",
                info.spec_level.get(),
                info.errata_rev
            );
            println!("  Vendor ID:     {}", vendor_id_string(info.tpm_vendor_id));

            let vendor_specific = &properties.version.vendor_specific;
            if vendor_specific.is_empty() {
                println!("  Vendor data:   <empty>");
            } else {
                println!("  Vendor data ({} bytes):", vendor_specific.len());
                hexdump(vendor_specific);
            }
        }
    }
}

fn print_flags(label: &str, tag: u16, flags: &[(&'static str, bool)]) {
    println!("{label} (tag {tag:#06x})");
    for (name, set) in flags {
        println!("  {name:<34}{set}");
    }
}

fn hexdump(data: &[u8]) {
    for (row, chunk) in data.chunks(16).enumerate() {
        print!("    {:04x}: ", row * 16);
        let mut ascii = String::new();
        for byte in chunk {
            print!("{:02x} ", byte);
            let ch = if (0x20..=0x7e).contains(byte) {
                *byte as char
            } else {
                '.'
            };
            ascii.push(ch);
        }
        for _ in chunk.len()..16 {
            print!("   ");
        }
        println!(" |{}|", ascii);
    }
}

fn run(args: &CmdArgs) -> anyhow::Result<()> {
    let config = args.transport_config()?;
    tracing::debug!(?config, "resolved transport configuration");

    let transport = open_transport(&config).context("failed to open TPM transport")?;
    let mut helper = Tpm12CommandHelper::new(transport);
    let report = query(&mut helper, args.queries())?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report.to_json())?);
    } else {
        report.print();
    }

    Ok(())
}

fn main() {
    let args = CmdArgs::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .log_internal_errors(true)
        .with_max_level(if args.verbose {
            tracing::Level::TRACE
        } else {
            tracing::Level::INFO
        })
        .init();

    if let Err(err) = run(&args) {
        eprintln!("error: {err}");
        for inner in err.chain().skip(1) {
            eprintln!("caused by: {inner}");
        }
        std::process::exit(1);
    }
}
