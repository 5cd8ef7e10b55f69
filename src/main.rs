use chrono::Utc;
use clap::{Arg, ArgMatches, Command};
use futures_util::future::join_all;
use log::LevelFilter;
use mxbl::action::{EventKind, LogSink, MailEvent};
use mxbl::config::{Config, DEFAULT_CONFIG_PATH};
use mxbl::orchestrator::CheckOptions;
use mxbl::pattern::{Pattern, Severity};
use mxbl::resolver::DnsResolver;
use mxbl::service::MxblService;
use mxbl::store::{ListFilter, SqliteStore};
use serde::Serialize;
use std::fmt::Display;
use std::process;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

fn id_arg() -> Arg {
    Arg::new("id")
        .help("Pattern id")
        .required(true)
        .value_parser(clap::value_parser!(u64))
}

fn words_arg(name: &'static str, help: &'static str) -> Arg {
    Arg::new(name)
        .help(help)
        .required(true)
        .num_args(1..)
}

fn build_cli() -> Command {
    Command::new("mxbl")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Email-domain blocklist checking MX hosts and their addresses")
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value(DEFAULT_CONFIG_PATH)
                .global(true),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file and exit")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(clap::ArgAction::SetTrue)
                .global(true),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .help("Print results as JSON")
                .action(clap::ArgAction::SetTrue)
                .global(true),
        )
        .arg(
            Arg::new("as")
                .long("as")
                .value_name("NAME")
                .help("Name recorded as the author of new patterns")
                .global(true),
        )
        .subcommand(
            Command::new("add")
                .about("Add a pattern at WARN: domain, IP, CIDR, %glob% or /regex/")
                .arg(Arg::new("pattern").required(true))
                .arg(words_arg("reason", "Why the pattern is listed")),
        )
        .subcommand(Command::new("del").about("Delete a pattern").arg(id_arg()))
        .subcommand(Command::new("get").about("Show one pattern").arg(id_arg()))
        .subcommand(
            Command::new("list")
                .about("List patterns, skipping OFF ones unless --all is given")
                .arg(
                    Arg::new("all")
                        .long("all")
                        .help("Include OFF patterns")
                        .action(clap::ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("limit")
                        .long("limit")
                        .help("Maximum number of entries, 0 for no limit")
                        .default_value("0")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    Arg::new("offset")
                        .long("offset")
                        .default_value("0")
                        .value_parser(clap::value_parser!(usize)),
                ),
        )
        .subcommand(
            Command::new("edit-pattern")
                .about("Replace the text of a pattern")
                .arg(id_arg())
                .arg(Arg::new("pattern").required(true)),
        )
        .subcommand(
            Command::new("edit-reason")
                .about("Replace the reason of a pattern")
                .arg(id_arg())
                .arg(words_arg("reason", "New reason")),
        )
        .subcommand(
            Command::new("set")
                .about("Set the severity of a pattern (LETHAL, WARN or OFF)")
                .arg(id_arg())
                .arg(Arg::new("severity").required(true)),
        )
        .subcommand(
            Command::new("toggle")
                .about("Switch a pattern between WARN and LETHAL")
                .arg(id_arg()),
        )
        .subcommand(
            Command::new("test")
                .about("Check an email or domain against the blocklist without side effects")
                .arg(Arg::new("email").required(true)),
        )
        .subcommand(
            Command::new("testpat")
                .about("Check an email or domain against an ad-hoc pattern")
                .arg(Arg::new("pattern").required(true))
                .arg(Arg::new("email").required(true)),
        )
        .subcommand(
            Command::new("settings")
                .about("Read or change runtime settings")
                .subcommand_required(true)
                .subcommand(Command::new("get").arg(Arg::new("name").required(true)))
                .subcommand(Command::new("getall"))
                .subcommand(
                    Command::new("set")
                        .arg(Arg::new("name").required(true))
                        .arg(Arg::new("value").required(true)),
                ),
        )
        .subcommand(
            Command::new("check")
                .about("Run the cached pipeline for several addresses concurrently")
                .arg(words_arg("email", "Email addresses or domains")),
        )
        .subcommand(
            Command::new("watch").about(
                "Read 'register|emailchg <account> <email>' lines from stdin and act on them",
            ),
        )
}

#[tokio::main]
async fn main() {
    let matches = build_cli().get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or(DEFAULT_CONFIG_PATH);
    let config = if std::path::Path::new(config_path).exists() {
        match Config::load(config_path) {
            Ok(config) => config,
            Err(e) => fail("Error loading configuration", format!("{e:#}")),
        }
    } else {
        log::debug!("No configuration at {config_path}, using defaults");
        Config::default()
    };

    let service = build_service(&config);
    let output = Output {
        json: matches.get_flag("json"),
    };
    let author = matches
        .get_one::<String>("as")
        .cloned()
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "cli".to_string());

    match matches.subcommand() {
        Some((name, sub)) => run_command(&service, &output, &author, name, sub).await,
        None => {
            if let Err(e) = build_cli().print_help() {
                fail("Failed to print help", e);
            }
        }
    }
}

fn build_service(config: &Config) -> MxblService {
    let store = match SqliteStore::open(&config.database) {
        Ok(store) => Arc::new(store),
        Err(e) => fail("Error opening database", format!("{e:#}")),
    };
    let resolver = match DnsResolver::from_system_conf(config.resolver_timeout()) {
        Ok(resolver) => Arc::new(resolver),
        Err(e) => fail("Error creating DNS resolver", e),
    };

    MxblService::with_store(
        store,
        resolver,
        Arc::new(LogSink),
        CheckOptions::from(config),
        config.cache.max_entries,
    )
}

async fn run_command(service: &MxblService, output: &Output, author: &str, name: &str, sub: &ArgMatches) {
    match name {
        "add" => {
            let pattern = sub.get_one::<String>("pattern").map(String::as_str).unwrap_or_default();
            let reason = joined(sub, "reason");
            match service.add(pattern, &reason, author) {
                Ok(p) => output.pattern("Added", &p),
                Err(e) => fail("ADD failed", e),
            }
        }
        "del" => match service.delete(id(sub)) {
            Ok(p) => output.pattern("Deleted", &p),
            Err(e) => fail("DEL failed", e),
        },
        "get" => match service.get(id(sub)) {
            Ok(p) => output.pattern("", &p),
            Err(e) => fail("GET failed", e),
        },
        "list" => {
            let filter = ListFilter {
                include_off: sub.get_flag("all"),
                limit: sub.get_one::<usize>("limit").copied().unwrap_or(0),
                offset: sub.get_one::<usize>("offset").copied().unwrap_or(0),
            };
            match service.list(filter) {
                Ok(patterns) => output.patterns(&patterns),
                Err(e) => fail("LIST failed", e),
            }
        }
        "edit-pattern" => {
            let pattern = sub.get_one::<String>("pattern").map(String::as_str).unwrap_or_default();
            match service.edit_pattern(id(sub), pattern) {
                Ok(p) => output.pattern("Updated", &p),
                Err(e) => fail("EDITPATTERN failed", e),
            }
        }
        "edit-reason" => match service.edit_reason(id(sub), &joined(sub, "reason")) {
            Ok(p) => output.pattern("Updated", &p),
            Err(e) => fail("EDITREASON failed", e),
        },
        "set" => {
            let raw = sub.get_one::<String>("severity").map(String::as_str).unwrap_or_default();
            let severity: Severity = match raw.parse() {
                Ok(severity) => severity,
                Err(_) => fail("SET failed", format!("unknown severity '{raw}', expected LETHAL, WARN or OFF")),
            };
            match service.set_severity(id(sub), severity) {
                Ok((p, old)) => output.pattern(&format!("Changed from {old}:"), &p),
                Err(e) => fail("SET failed", e),
            }
        }
        "toggle" => match service.toggle(id(sub)) {
            Ok((p, old)) => output.pattern(&format!("Toggled from {old}:"), &p),
            Err(e) => fail("TOGGLE failed", e),
        },
        "test" => {
            let email = sub.get_one::<String>("email").map(String::as_str).unwrap_or_default();
            match service.test(email).await {
                Ok(verdict) => output.line(&verdict, format!("{email}: {verdict}")),
                Err(e) => fail("TEST failed", e),
            }
        }
        "testpat" => {
            let pattern = sub.get_one::<String>("pattern").map(String::as_str).unwrap_or_default();
            let email = sub.get_one::<String>("email").map(String::as_str).unwrap_or_default();
            match service.test_pattern(pattern, email).await {
                Ok(Some(value)) => output.line(&Some(&value), format!("{email}: {pattern} matched on {value}")),
                Ok(None) => output.line(&None::<String>, format!("{email}: {pattern} did not match")),
                Err(e) => fail("TESTPAT failed", e),
            }
        }
        "settings" => run_settings(service, output, sub),
        "check" => run_check(service, output, sub).await,
        "watch" => run_watch(service, output).await,
        other => fail("Unknown command", other),
    }
}

fn run_settings(service: &MxblService, output: &Output, sub: &ArgMatches) {
    let settings = service.settings();
    match sub.subcommand() {
        Some(("get", args)) => {
            let name = args.get_one::<String>("name").map(String::as_str).unwrap_or_default();
            match settings.get(name) {
                Ok(Some(value)) => output.line(&value, format!("{name} = {value}")),
                Ok(None) => fail("SETTINGS GET failed", format!("no setting named '{name}'")),
                Err(e) => fail("SETTINGS GET failed", e),
            }
        }
        Some(("getall", _)) => match settings.all() {
            Ok(all) => {
                let text = all
                    .iter()
                    .map(|(name, value)| format!("{name} = {value}"))
                    .collect::<Vec<_>>()
                    .join("\n");
                output.line(&all, text);
            }
            Err(e) => fail("SETTINGS GETALL failed", e),
        },
        Some(("set", args)) => {
            let name = args.get_one::<String>("name").map(String::as_str).unwrap_or_default();
            let value = args.get_one::<String>("value").map(String::as_str).unwrap_or_default();
            match settings.set(name, value) {
                Ok(()) => output.line(&value, format!("{name} = {value}")),
                Err(e) => fail("SETTINGS SET failed", e),
            }
        }
        _ => fail("Unknown settings command", sub.subcommand_name().unwrap_or_default()),
    }
}

async fn run_check(service: &MxblService, output: &Output, sub: &ArgMatches) {
    let emails: Vec<&String> = sub.get_many::<String>("email").map(Iterator::collect).unwrap_or_default();
    let orchestrator = service.orchestrator();
    let results = join_all(emails.iter().map(|email| orchestrator.check_domain(email))).await;

    let mut failed = false;
    for (email, result) in emails.iter().zip(results) {
        match result {
            Ok(verdict) => output.line(&verdict, format!("{email}: {verdict}")),
            Err(e) => {
                eprintln!("{email}: {e}");
                failed = true;
            }
        }
    }

    print_cache(service, output);
    if failed {
        process::exit(1);
    }
}

async fn run_watch(service: &MxblService, output: &Output) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut pending = Vec::new();

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => match parse_watch_line(&line) {
                    Some(WatchLine::Event(event)) => {
                        let orchestrator = service.orchestrator().clone();
                        let output = *output;
                        pending.push(tokio::spawn(async move {
                            match orchestrator.handle_event(event).await {
                                Ok(Some(detection)) if output.json => output.line(&detection, String::new()),
                                Ok(_) => {}
                                Err(e) => log::warn!("{e}"),
                            }
                        }));
                    }
                    Some(WatchLine::CacheShow) => print_cache(service, output),
                    Some(WatchLine::CacheDel(domain)) => {
                        if service.cache_del(&domain) {
                            println!("Evicted {domain} from the clean cache");
                        } else {
                            println!("{domain} is not cached");
                        }
                    }
                    None if line.trim().is_empty() => {}
                    None => log::warn!("Ignoring malformed line: {line}"),
                },
                Ok(None) => break,
                Err(e) => {
                    log::error!("Failed to read events: {e}");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, stopping");
                return;
            }
        }
    }

    for handle in join_all(pending).await {
        if let Err(e) = handle {
            log::error!("Event task failed: {e}");
        }
    }
}

#[derive(Debug, PartialEq)]
enum WatchLine {
    Event(MailEvent),
    CacheShow,
    CacheDel(String),
}

/// `register <account> <email>`, `emailchg <account> <email>`,
/// `cache show` or `cache del <domain>`
fn parse_watch_line(line: &str) -> Option<WatchLine> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let command = parts.first()?.to_ascii_lowercase();
    let kind = match (command.as_str(), parts.len()) {
        ("register", 3) => EventKind::Registration,
        ("emailchg", 3) => EventKind::EmailChange,
        ("cache", 2) if parts[1].eq_ignore_ascii_case("show") => return Some(WatchLine::CacheShow),
        ("cache", 3) if parts[1].eq_ignore_ascii_case("del") => {
            return Some(WatchLine::CacheDel(parts[2].to_string()))
        }
        _ => return None,
    };
    Some(WatchLine::Event(MailEvent::new(parts[1], parts[2], kind)))
}

fn print_cache(service: &MxblService, output: &Output) {
    let cached = service.cache_show();
    let listing: Vec<_> = cached
        .iter()
        .map(|entry| CachedDomain {
            domain: &entry.domain,
            candidates: entry.candidates.values(),
            expires_in: entry.remaining().as_secs(),
        })
        .collect();
    let text = if listing.is_empty() {
        "Clean cache is empty".to_string()
    } else {
        listing
            .iter()
            .map(|c| format!("{} ({}) expires in {}s", c.domain, c.candidates.join(", "), c.expires_in))
            .collect::<Vec<_>>()
            .join("\n")
    };
    output.line(&listing, text);
}

#[derive(Serialize)]
struct CachedDomain<'a> {
    domain: &'a str,
    candidates: Vec<&'a str>,
    expires_in: u64,
}

fn id(sub: &ArgMatches) -> u64 {
    sub.get_one::<u64>("id").copied().unwrap_or_default()
}

fn joined(sub: &ArgMatches, name: &str) -> String {
    sub.get_many::<String>(name)
        .map(|words| words.map(String::as_str).collect::<Vec<_>>().join(" "))
        .unwrap_or_default()
}

#[derive(Clone, Copy)]
struct Output {
    json: bool,
}

impl Output {
    fn line<T: Serialize>(&self, value: &T, text: String) {
        if self.json {
            match serde_json::to_string_pretty(value) {
                Ok(json) => println!("{json}"),
                Err(e) => fail("Failed to serialize output", e),
            }
        } else {
            println!("{text}");
        }
    }

    fn pattern(&self, label: &str, pattern: &Pattern) {
        let summary = pattern.summary(Utc::now());
        let text = if label.is_empty() {
            summary
        } else {
            format!("{label} {summary}")
        };
        self.line(pattern, text);
    }

    fn patterns(&self, patterns: &[Pattern]) {
        let now = Utc::now();
        let text = if patterns.is_empty() {
            "No entries".to_string()
        } else {
            patterns
                .iter()
                .map(|p| p.summary(now))
                .collect::<Vec<_>>()
                .join("\n")
        };
        self.line(&patterns, text);
    }
}

fn fail(context: &str, error: impl Display) -> ! {
    eprintln!("{context}: {error}");
    process::exit(1);
}

fn generate_default_config(path: &str) {
    let yaml = match Config::default().to_yaml() {
        Ok(yaml) => yaml,
        Err(e) => fail("Error generating config", e),
    };
    match std::fs::write(path, yaml) {
        Ok(()) => println!("Default configuration written to: {path}"),
        Err(e) => fail("Error writing config file", e),
    }
}
