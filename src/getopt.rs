//! Usage-message-driven option parsing
//!
//! The option table is extracted from the usage text itself, the way
//! line-oriented scripts describe their interface:
//!
//! ```text
//! Usage: frob [options] <input>
//!   -h, --help         show this message
//!   -v, --verbose      more output
//!   -o PATH, --output=PATH   write here
//! ```
//!
//! Short options may bundle (`-vv`); long options take values as
//! `--output=x` or `--output x`. `-h`/`--help` prints the usage and exits
//! 0. Parse errors print the usage and exit 1, unless `no_exit` is set, in
//! which case they come back as a status.

use crate::status::Status;
use std::collections::HashMap;

/// One parsed option occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptValue {
    /// A flag, with its occurrence count.
    Flag(u32),
    /// An option argument; repeated occurrences keep the last value.
    Arg(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct OptSpec {
    short: Option<char>,
    long: Option<String>,
    takes_arg: bool,
}

impl OptSpec {
    /// The key occurrences are stored under: the long name when there is
    /// one.
    fn key(&self) -> String {
        match (&self.long, self.short) {
            (Some(long), _) => long.clone(),
            (None, Some(short)) => short.to_string(),
            (None, None) => String::new(),
        }
    }
}

/// Extract the option table from a usage message.
fn parse_usage(usage: &str) -> Vec<OptSpec> {
    let mut specs: Vec<OptSpec> = Vec::new();
    for line in usage.lines() {
        let mut spec = OptSpec {
            short: None,
            long: None,
            takes_arg: false,
        };
        let mut found = false;
        let tokens: Vec<&str> = line
            .split_whitespace()
            .map(|t| t.trim_end_matches(','))
            .collect();
        for (i, token) in tokens.iter().enumerate() {
            if let Some(rest) = token.strip_prefix("--") {
                if rest.is_empty() {
                    continue;
                }
                let (name, has_arg) = match rest.split_once('=') {
                    Some((name, _)) => (name, true),
                    None => (rest, false),
                };
                if !name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric()) {
                    continue;
                }
                spec.long = Some(name.to_string());
                spec.takes_arg |= has_arg;
                found = true;
            } else if let Some(rest) = token.strip_prefix('-') {
                let mut chars = rest.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) if c.is_ascii_alphanumeric() && spec.short.is_none() => {
                        spec.short = Some(c);
                        found = true;
                        // A following placeholder (`-o PATH` or `-o <path>`)
                        // marks an argument-taking short option.
                        if let Some(next) = tokens.get(i + 1) {
                            let bare = next.trim_matches(|c| c == '<' || c == '>');
                            if !next.starts_with('-')
                                && !bare.is_empty()
                                && (next.starts_with('<')
                                    || bare.chars().all(|c| c.is_ascii_uppercase()))
                            {
                                spec.takes_arg = true;
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        if found {
            specs.push(spec);
        }
    }
    specs
}

fn find_long<'a>(specs: &'a [OptSpec], name: &str) -> Option<&'a OptSpec> {
    specs.iter().find(|s| s.long.as_deref() == Some(name))
}

fn find_short(specs: &[OptSpec], c: char) -> Option<&OptSpec> {
    specs.iter().find(|s| s.short == Some(c))
}

fn record(opts: &mut HashMap<String, OptValue>, spec: &OptSpec, value: Option<String>) {
    let key = spec.key();
    match value {
        Some(value) => {
            opts.insert(key, OptValue::Arg(value));
        }
        None => match opts.entry(key).or_insert(OptValue::Flag(0)) {
            OptValue::Flag(count) => *count += 1,
            other => *other = OptValue::Flag(1),
        },
    }
}

fn fail(usage: &str, message: String, no_exit: bool) -> Status {
    if no_exit {
        return Status::invalid(message);
    }
    eprintln!("{message}");
    eprintln!("{usage}");
    std::process::exit(1);
}

/// Parse `args` against the options described in `usage`, returning the
/// option map and the positional arguments.
pub fn parse(
    usage: &str,
    args: &[String],
    no_exit: bool,
) -> Result<(HashMap<String, OptValue>, Vec<String>), Status> {
    let specs = parse_usage(usage);
    let mut opts = HashMap::new();
    let mut positional = Vec::new();
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        if arg == "--" {
            positional.extend(iter.cloned());
            break;
        }
        if let Some(rest) = arg.strip_prefix("--") {
            let (name, inline) = match rest.split_once('=') {
                Some((name, value)) => (name, Some(value.to_string())),
                None => (rest, None),
            };
            if name == "help" {
                println!("{usage}");
                std::process::exit(0);
            }
            let Some(spec) = find_long(&specs, name) else {
                return Err(fail(usage, format!("unknown option --{name}"), no_exit));
            };
            let value = if spec.takes_arg {
                match inline.or_else(|| iter.next().cloned()) {
                    Some(value) => Some(value),
                    None => {
                        return Err(fail(
                            usage,
                            format!("option --{name} requires a value"),
                            no_exit,
                        ));
                    }
                }
            } else {
                if inline.is_some() {
                    return Err(fail(
                        usage,
                        format!("option --{name} takes no value"),
                        no_exit,
                    ));
                }
                None
            };
            record(&mut opts, spec, value);
        } else if let Some(cluster) = arg.strip_prefix('-') {
            if cluster.is_empty() {
                positional.push(arg.clone());
                continue;
            }
            let mut chars = cluster.char_indices();
            while let Some((at, c)) = chars.next() {
                if c == 'h' {
                    println!("{usage}");
                    std::process::exit(0);
                }
                let Some(spec) = find_short(&specs, c) else {
                    return Err(fail(usage, format!("unknown option -{c}"), no_exit));
                };
                if spec.takes_arg {
                    // The rest of the cluster, or the next argument, is the
                    // value.
                    let rest = &cluster[at + c.len_utf8()..];
                    let value = if rest.is_empty() {
                        iter.next().cloned()
                    } else {
                        Some(rest.to_string())
                    };
                    match value {
                        Some(value) => record(&mut opts, spec, Some(value)),
                        None => {
                            return Err(fail(
                                usage,
                                format!("option -{c} requires a value"),
                                no_exit,
                            ));
                        }
                    }
                    break;
                }
                record(&mut opts, spec, None);
            }
        } else {
            positional.push(arg.clone());
        }
    }
    Ok((opts, positional))
}
