use super::*;

#[derive(Debug, Clone, Parser)]
pub(crate) struct Options {
    #[arg(
        short,
        long,
        env = "HIVE_CONFIG",
        default_value = "agent_conf.json",
        help = "Load JSON configuration from <CONFIG>."
    )]
    pub(crate) config: std::path::PathBuf,

    #[arg(long, help = "Listen for miners on <LISTEN> instead of the configured address.")]
    pub(crate) listen: Option<String>,
}
