use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Parser;

use crate::orchestrator::TestParameter;

#[derive(Parser, Debug)]
#[command(
    name = "ets-bridge",
    about = "Run one conformance test case and stream it as JSON lines",
    version
)]
pub struct Cli {
    /// Port of the radio dongle (e.g., "COM5")
    pub port: String,

    /// Profile under test (e.g., "GATT")
    pub profile: String,

    /// Test case name (e.g., "GATT/CL/GAC/BV-01-C")
    pub test_case: String,

    /// Test parameters as NAME TYPE VALUE triples
    #[arg(value_name = "NAME TYPE VALUE", num_args = 0.., allow_negative_numbers = true)]
    pub parameters: Vec<String>,

    /// Config file to use instead of searching for .ets-bridge/config.toml
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Tear down completed lifecycle steps when a later step fails
    #[arg(long)]
    pub teardown_on_failure: bool,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Group the trailing arguments into parameter triples.
    pub fn test_parameters(&self) -> Result<Vec<TestParameter>> {
        parse_parameters(&self.parameters)
    }
}

pub fn parse_parameters(args: &[String]) -> Result<Vec<TestParameter>> {
    if args.len() % 3 != 0 {
        bail!(
            "test parameters must be NAME TYPE VALUE triples; got {} trailing argument(s)",
            args.len()
        );
    }
    Ok(args
        .chunks_exact(3)
        .map(|triple| TestParameter::new(&triple[0], &triple[1], &triple[2]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("ets-bridge").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn positional_arguments() {
        let cli = parse(&["COM5", "GATT", "GATT/CL/GAC/BV-01-C"]);
        assert_eq!(cli.port, "COM5");
        assert_eq!(cli.profile, "GATT");
        assert_eq!(cli.test_case, "GATT/CL/GAC/BV-01-C");
        assert!(cli.test_parameters().unwrap().is_empty());
        assert_eq!(cli.verbose, 0);
        assert!(!cli.teardown_on_failure);
    }

    #[test]
    fn parameter_triples_in_order() {
        let cli = parse(&[
            "COM5",
            "GATT",
            "GATT/CL/GAC/BV-01-C",
            "TSPX_bd_addr_iut",
            "OCTETSTRING",
            "001122334455",
            "TSPX_delete_link_key",
            "BOOLEAN",
            "TRUE",
        ]);
        let params = cli.test_parameters().unwrap();
        assert_eq!(
            params,
            vec![
                TestParameter::new("TSPX_bd_addr_iut", "OCTETSTRING", "001122334455"),
                TestParameter::new("TSPX_delete_link_key", "BOOLEAN", "TRUE"),
            ]
        );
    }

    #[test]
    fn incomplete_triple_is_rejected() {
        let cli = parse(&["COM5", "GATT", "TC", "TSPX_a", "INTEGER"]);
        let err = cli.test_parameters().unwrap_err();
        assert!(err.to_string().contains("triples"));
    }

    #[test]
    fn missing_positionals_are_rejected() {
        assert!(Cli::try_parse_from(["ets-bridge", "COM5", "GATT"]).is_err());
    }

    #[test]
    fn flags_and_negative_values() {
        let cli = parse(&[
            "-vv",
            "--teardown-on-failure",
            "--config",
            "bridge.toml",
            "COM5",
            "GATT",
            "TC",
            "TSPX_offset",
            "INTEGER",
            "-5",
        ]);
        assert_eq!(cli.verbose, 2);
        assert!(cli.teardown_on_failure);
        assert_eq!(cli.config, Some(PathBuf::from("bridge.toml")));
        assert_eq!(
            cli.test_parameters().unwrap(),
            vec![TestParameter::new("TSPX_offset", "INTEGER", "-5")]
        );
    }

    #[test]
    fn flags_after_parameters_are_still_flags() {
        let cli = parse(&[
            "COM5",
            "GATT",
            "TC",
            "TSPX_a",
            "INTEGER",
            "1",
            "--teardown-on-failure",
            "-v",
        ]);
        assert!(cli.teardown_on_failure);
        assert_eq!(cli.verbose, 1);
        assert_eq!(
            cli.test_parameters().unwrap(),
            vec![TestParameter::new("TSPX_a", "INTEGER", "1")]
        );
    }
}
