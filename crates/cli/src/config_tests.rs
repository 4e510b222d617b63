// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use yare::parameterized;

use super::*;

fn parse(args: &[&str]) -> Config {
    let mut argv = vec!["corral"];
    argv.extend_from_slice(args);
    match Config::try_parse_from(argv) {
        Ok(c) => c,
        Err(e) => unreachable!("parse failed: {e}"),
    }
}

#[test]
fn defaults() {
    let config = parse(&[]);
    assert_eq!(config.host, "127.0.0.1");
    assert_eq!(config.port, 18900);
    assert_eq!(config.backend, "auto");
    assert_eq!(config.max_sessions, 100);
    assert_eq!(config.transcript_max, 500);
    assert_eq!(config.audit_ring, 1000);
    assert!(!config.skip_permissions);
    assert!(config.validate().is_ok());
}

#[test]
fn rejects_short_auth_token() {
    let config = parse(&["--auth-token", "short"]);
    assert!(config.validate().is_err());
}

#[test]
fn accepts_eight_char_token() {
    let config = parse(&["--auth-token", "12345678"]);
    assert!(config.validate().is_ok());
}

#[test]
fn rejects_unknown_backend() {
    let config = parse(&["--backend", "zmux"]);
    assert!(config.validate().is_err());
}

#[test]
fn generated_token_is_32_hex_chars() {
    let config = parse(&[]);
    let token = config.effective_auth_token();
    assert_eq!(token.len(), 32);
    assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn allow_args_extends_base_list() {
    let config = parse(&["--allow-args", "--special, --other"]);
    let allowed = config.allowed_args();
    assert!(allowed.iter().any(|f| f == "--model"));
    assert!(allowed.iter().any(|f| f == "--special"));
    assert!(allowed.iter().any(|f| f == "--other"));
}

#[parameterized(
    zero = { Some(0.0), 1 },
    negative = { Some(-5.0), 1 },
    over = { Some(600.0), 500 },
    way_over = { Some(999.0), 500 },
    infinite = { Some(f64::INFINITY), 24 },
    nan = { Some(f64::NAN), 24 },
    absent = { None, 24 },
    round_up = { Some(80.7), 81 },
    round_down = { Some(80.3), 80 },
)]
fn clamp_dimension_cases(input: Option<f64>, expected: u16) {
    assert_eq!(clamp_dimension(input, 24), expected);
}
