//! Tests for add and run subcommands.

use std::path::PathBuf;

use super::parse;
use crate::cli::{Cli, CliCommand, PriorityArg};
use clap::Parser;

#[test]
fn cli_parse_add_defaults() {
    match parse(&["haul", "add", "https://example.com/file.iso", "-o", "/tmp/file.iso"]) {
        CliCommand::Add {
            url,
            output,
            id,
            group,
            priority,
            headers,
        } => {
            assert_eq!(url, "https://example.com/file.iso");
            assert_eq!(output, PathBuf::from("/tmp/file.iso"));
            assert!(id.is_none());
            assert_eq!(group, 0);
            assert_eq!(priority, PriorityArg::Normal);
            assert!(headers.is_empty());
        }
        _ => panic!("expected Add"),
    }
}

#[test]
fn cli_parse_add_with_options() {
    match parse(&[
        "haul",
        "add",
        "haulfs://10.0.0.2:7000/3",
        "--output",
        "out.bin",
        "--id",
        "99",
        "--group",
        "4",
        "--priority",
        "high",
        "-H",
        "Authorization: secret",
        "--header",
        "Client:haul",
    ]) {
        CliCommand::Add {
            id,
            group,
            priority,
            headers,
            ..
        } => {
            assert_eq!(id, Some(99));
            assert_eq!(group, 4);
            assert_eq!(priority, PriorityArg::High);
            assert_eq!(
                headers,
                vec![
                    ("Authorization".to_string(), "secret".to_string()),
                    ("Client".to_string(), "haul".to_string()),
                ]
            );
        }
        _ => panic!("expected Add with options"),
    }
}

#[test]
fn cli_parse_add_requires_output() {
    assert!(Cli::try_parse_from(["haul", "add", "https://example.com/x"]).is_err());
}

#[test]
fn cli_parse_add_rejects_malformed_header() {
    assert!(Cli::try_parse_from([
        "haul",
        "add",
        "https://example.com/x",
        "-o",
        "x",
        "-H",
        "no-colon"
    ])
    .is_err());
}

#[test]
fn cli_parse_run() {
    match parse(&["haul", "run"]) {
        CliCommand::Run { jobs } => assert!(jobs.is_none()),
        _ => panic!("expected Run"),
    }
    match parse(&["haul", "run", "--jobs", "4"]) {
        CliCommand::Run { jobs } => assert_eq!(jobs, Some(4)),
        _ => panic!("expected Run --jobs"),
    }
}

#[test]
fn cli_parse_global_namespace() {
    let cli = Cli::try_parse_from(["haul", "run", "--namespace", "media"]).unwrap();
    assert_eq!(cli.namespace.as_deref(), Some("media"));
}
