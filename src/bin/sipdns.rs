//! sipdns command line tool
//!
//! Runs single lookups through the stub resolver, the same way a SIP stack
//! would: A/AAAA lookups with CNAME following, and SRV resolution of a
//! domain with A or AAAA fallback.

use std::cmp::min;
use std::error::Error;
use std::path::PathBuf;
use std::process;
use std::sync::mpsc::{channel, Receiver};
use std::time::{Duration, Instant};

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use colored::*;
use comfy_table::Table;
use serde_json::{json, Value};

use sipdns::dns::answer::parse_addr_response;
use sipdns::dns::logging::{LogLevel, LoggerConfig, LookupLog, StructuredLogger};
use sipdns::dns::protocol::{DnsPacket, DnsRecord, QueryType, CLASS_IN};
use sipdns::dns::resolver::{Resolver, ResolverSnapshot};
use sipdns::dns::settings::{NameserverConfig, ResolverConfig};
use sipdns::dns::srv::{srv_query_name, SrvOptions, SrvRecord};

/// Stub DNS resolver for SIP
#[derive(Parser)]
#[command(name = "sipdns")]
#[command(version, about = "Resolve SIP servers through a stub DNS resolver", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Nameserver as ip or ip:port, may be repeated
    #[arg(short = 'n', long = "nameserver", env = "SIPDNS_NAMESERVERS", value_delimiter = ',')]
    nameservers: Vec<String>,

    /// Resolver configuration file (TOML)
    #[arg(short, long, env = "SIPDNS_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short = 'o', long, value_enum, default_value = "table")]
    output: OutputFormat,

    /// More log output, may be repeated
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Log as JSON
    #[arg(long)]
    json_logs: bool,

    /// No color output
    #[arg(long)]
    no_color: bool,

    /// Give up after this many seconds
    #[arg(short, long, default_value_t = 15)]
    timeout: u64,

    /// Print the resolver state afterwards
    #[arg(long)]
    dump: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Clone, Copy)]
enum OutputFormat {
    Table,
    Json,
    Yaml,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum RecordType {
    A,
    Aaaa,
    Cname,
    Ns,
    Soa,
    Srv,
}

impl From<RecordType> for QueryType {
    fn from(record_type: RecordType) -> Self {
        match record_type {
            RecordType::A => QueryType::A,
            RecordType::Aaaa => QueryType::Aaaa,
            RecordType::Cname => QueryType::Cname,
            RecordType::Ns => QueryType::Ns,
            RecordType::Soa => QueryType::Soa,
            RecordType::Srv => QueryType::Srv,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Look up the records of a name
    Lookup(LookupArgs),

    /// Resolve the SIP servers of a domain
    Srv(SrvArgs),

    /// Show the effective resolver settings
    Settings,
}

#[derive(Args)]
struct LookupArgs {
    /// Name to look up
    name: String,

    /// Record type
    #[arg(short = 't', long = "type", value_enum, default_value = "a")]
    record_type: RecordType,
}

#[derive(Args)]
struct SrvArgs {
    /// SIP domain
    domain: String,

    /// Service and protocol prefix
    #[arg(short, long, default_value = "_sip._udp.")]
    service: String,

    /// Port used when the domain has no SRV records
    #[arg(short, long, default_value_t = 5060)]
    port: u16,

    /// Do not look up A records of the domain itself when it has no SRV records
    #[arg(long)]
    no_fallback: bool,

    /// Look up AAAA records of the domain itself when it has no SRV records
    #[arg(long)]
    fallback_aaaa: bool,

    /// Look up AAAA records of the targets too
    #[arg(long, conflicts_with = "aaaa_only")]
    aaaa: bool,

    /// Look up only AAAA records of the targets
    #[arg(long)]
    aaaa_only: bool,
}

struct OutputFormatter {
    format: OutputFormat,
}

impl OutputFormatter {
    fn new(format: OutputFormat, no_color: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self { format }
    }

    /// Print structured output, returns false when a table is wanted instead
    fn print_structured(&self, data: &Value) -> Result<bool, Box<dyn Error>> {
        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(data)?),
            OutputFormat::Yaml => print!("{}", serde_yaml::to_string(data)?),
            OutputFormat::Table => return Ok(false),
        }

        Ok(true)
    }

    fn print_packet(&self, packet: &DnsPacket) -> Result<(), Box<dyn Error>> {
        let data = json!({
            "rcode": packet.header.rescode.to_string(),
            "answers": packet.answers,
        });
        if self.print_structured(&data)? {
            return Ok(());
        }

        if packet.answers.is_empty() {
            self.print_warning("no records in answer");
            return Ok(());
        }

        let mut table = Table::new();
        table.set_header(vec!["Name", "Type", "TTL", "Data"]);
        for record in &packet.answers {
            table.add_row(vec![
                record.get_domain().to_string(),
                record.get_querytype().to_string(),
                record.get_ttl().to_string(),
                record_data(record),
            ]);
        }
        println!("{}", table);

        if let Ok(addrs) = parse_addr_response(packet) {
            if let Some(alias) = addrs.alias {
                self.print_info(&format!("{} is an alias of {}", addrs.name, alias));
            }
        }

        Ok(())
    }

    fn print_srv(&self, record: &SrvRecord) -> Result<(), Box<dyn Error>> {
        if self.print_structured(&serde_json::to_value(record)?)? {
            return Ok(());
        }

        let mut table = Table::new();
        table.set_header(vec!["Priority", "Weight", "Port", "Target", "Alias", "Addresses"]);
        for entry in &record.entries {
            let addrs: Vec<String> = entry.server.addrs.iter().map(|a| a.to_string()).collect();
            table.add_row(vec![
                entry.priority.to_string(),
                entry.weight.to_string(),
                entry.port.to_string(),
                entry.server.name.clone(),
                entry.server.alias.clone().unwrap_or_default(),
                addrs.join(", "),
            ]);
        }
        println!("{}", table);

        Ok(())
    }

    fn print_settings(&self, config: &ResolverConfig) -> Result<(), Box<dyn Error>> {
        if self.print_structured(&serde_json::to_value(config)?)? {
            return Ok(());
        }

        let mut table = Table::new();
        table.set_header(vec!["Setting", "Value"]);
        if let Value::Object(settings) = serde_json::to_value(&config.settings)? {
            for (key, value) in settings {
                table.add_row(vec![key, value.to_string()]);
            }
        }
        for ns in &config.nameservers {
            table.add_row(vec!["nameserver".to_string(), format!("{}:{}", ns.host, ns.port)]);
        }
        println!("{}", table);

        Ok(())
    }

    fn print_snapshot(&self, snapshot: &ResolverSnapshot) -> Result<(), Box<dyn Error>> {
        if self.print_structured(&serde_json::to_value(snapshot)?)? {
            return Ok(());
        }

        self.print_info(&format!("mode: {:?}", snapshot.mode));

        let mut table = Table::new();
        table.set_header(vec!["Nameserver", "Health", "RTT (ms)", "Bad for (s)"]);
        for ns in &snapshot.nameservers {
            table.add_row(vec![
                ns.addr.to_string(),
                format!("{:?}", ns.health),
                ns.rtt_ms.map(|rtt| rtt.to_string()).unwrap_or_default(),
                ns.bad_for_secs.map(|secs| secs.to_string()).unwrap_or_default(),
            ]);
        }
        println!("{}", table);

        let mut cache = Table::new();
        cache.set_header(vec!["Cached name", "Type", "Answers", "Expires in (s)"]);
        for entry in &snapshot.cache {
            cache.add_row(vec![
                entry.key.name.clone(),
                entry.key.qtype.to_string(),
                entry.answers.to_string(),
                entry.remaining_secs.to_string(),
            ]);
        }
        println!("{}", cache);

        Ok(())
    }

    fn print_error(&self, message: &str) {
        eprintln!("{} {}", "✗".red().bold(), message);
    }

    fn print_warning(&self, message: &str) {
        println!("{} {}", "⚠".yellow().bold(), message);
    }

    fn print_info(&self, message: &str) {
        println!("{} {}", "ℹ".blue().bold(), message);
    }
}

fn record_data(record: &DnsRecord) -> String {
    match *record {
        DnsRecord::A { addr, .. } => addr.to_string(),
        DnsRecord::Aaaa { addr, .. } => addr.to_string(),
        DnsRecord::Ns { ref host, .. } | DnsRecord::Cname { ref host, .. } => host.clone(),
        DnsRecord::Srv {
            priority,
            weight,
            port,
            ref host,
            ..
        } => format!("{} {} {} {}", priority, weight, port, host),
        DnsRecord::Soa {
            ref m_name,
            ref r_name,
            serial,
            ..
        } => format!("{} {} {}", m_name, r_name, serial),
        DnsRecord::Unknown { ref data, .. } => format!("({} bytes)", data.len()),
    }
}

fn load_config(cli: &Cli) -> Result<ResolverConfig, Box<dyn Error>> {
    let mut config = match cli.config {
        Some(ref path) => ResolverConfig::load(path)?,
        None => ResolverConfig::default(),
    };

    if !cli.nameservers.is_empty() {
        config.nameservers = cli
            .nameservers
            .iter()
            .map(|spec| NameserverConfig::parse(spec))
            .collect::<Result<Vec<_>, _>>()?;
    }

    Ok(config)
}

/// Drive the resolver until the callback has sent its result
fn wait_for<T>(resolver: &Resolver, rx: &Receiver<T>, timeout: Duration) -> Option<T> {
    let deadline = Instant::now() + timeout;

    loop {
        if let Ok(value) = rx.try_recv() {
            return Some(value);
        }

        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        resolver.handle_events(min(deadline - now, Duration::from_millis(50)));
    }
}

fn run_lookup(
    args: &LookupArgs,
    resolver: &Resolver,
    timeout: Duration,
    logger: &StructuredLogger,
    formatter: &OutputFormatter,
) -> Result<bool, Box<dyn Error>> {
    let qtype = QueryType::from(args.record_type);
    let (tx, rx) = channel();
    let started = Instant::now();

    resolver.start_query(&args.name, qtype, CLASS_IN, move |result| {
        let _ = tx.send(result);
    })?;

    match wait_for(resolver, &rx, timeout) {
        Some(Ok(packet)) => {
            logger.log_lookup(&LookupLog::new(
                &args.name,
                &qtype.to_string(),
                &packet.header.rescode.to_string(),
                packet.answers.len(),
                started.elapsed(),
            ));
            formatter.print_packet(&packet)?;
            Ok(true)
        }
        Some(Err(e)) => {
            logger.log_lookup(&LookupLog::new(
                &args.name,
                &qtype.to_string(),
                &e.to_string(),
                0,
                started.elapsed(),
            ));
            formatter.print_error(&format!("{} {}: {}", args.name, qtype, e));
            Ok(false)
        }
        None => {
            formatter.print_error(&format!("{} {}: no result after {}s", args.name, qtype, timeout.as_secs()));
            Ok(false)
        }
    }
}

fn run_srv(
    args: &SrvArgs,
    resolver: &Resolver,
    timeout: Duration,
    logger: &StructuredLogger,
    formatter: &OutputFormatter,
) -> Result<bool, Box<dyn Error>> {
    let options = SrvOptions {
        fallback_a: !args.no_fallback,
        fallback_aaaa: args.fallback_aaaa,
        resolve_aaaa: args.aaaa,
        aaaa_only: args.aaaa_only,
    };
    let query_name = srv_query_name(args.domain.trim_end_matches('.'), &args.service);
    let (tx, rx) = channel();
    let started = Instant::now();

    resolver.srv_resolve(&args.domain, &args.service, args.port, options, move |result| {
        let _ = tx.send(result);
    })?;

    match wait_for(resolver, &rx, timeout) {
        Some(Ok(record)) => {
            logger.log_lookup(&LookupLog::new(
                &query_name,
                "SRV",
                "NOERROR",
                record.entries.len(),
                started.elapsed(),
            ));
            formatter.print_srv(&record)?;
            Ok(true)
        }
        Some(Err(e)) => {
            logger.log_lookup(&LookupLog::new(&query_name, "SRV", &e.to_string(), 0, started.elapsed()));
            formatter.print_error(&format!("{}: {}", query_name, e));
            Ok(false)
        }
        None => {
            formatter.print_error(&format!("{}: no result after {}s", query_name, timeout.as_secs()));
            Ok(false)
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let logger = StructuredLogger::init(LoggerConfig {
        level: LogLevel::from_verbosity(cli.verbose),
        json_format: cli.json_logs,
        console_output: true,
    })?;
    let formatter = OutputFormatter::new(cli.output, cli.no_color);

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            formatter.print_error(&format!("invalid configuration: {}", e));
            process::exit(2);
        }
    };

    if let Commands::Settings = cli.command {
        return formatter.print_settings(&config);
    }

    if config.nameservers.is_empty() {
        formatter.print_error("no nameservers given, use --nameserver or --config");
        process::exit(2);
    }

    let resolver = Resolver::from_config("sipdns", &config)?;
    let timeout = Duration::from_secs(cli.timeout);

    let succeeded = match cli.command {
        Commands::Lookup(ref args) => run_lookup(args, &resolver, timeout, &logger, &formatter)?,
        Commands::Srv(ref args) => run_srv(args, &resolver, timeout, &logger, &formatter)?,
        Commands::Settings => true,
    };

    if cli.dump {
        formatter.print_snapshot(&resolver.snapshot())?;
    }
    resolver.destroy();

    if !succeeded {
        process::exit(1);
    }

    Ok(())
}
