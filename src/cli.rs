use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, author, about = "SNMP-to-TSDB polling agent")]
pub struct Opts {
    /// Path to a config file or a directory of config files.
    #[arg(short, long, value_name = "PATH", default_value = "/opt/influxsnmp/conf")]
    pub config: String,

    /// Dump the resolved configuration and exit.
    #[arg(long)]
    pub showconf: bool,

    /// Enable verbose (debug-level) logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Default device poll interval in seconds, overriding each device's
    /// configured freq when set.
    #[arg(long, value_name = "SECONDS")]
    pub freq: Option<u64>,

    /// Port for the embedded HTTP status endpoint; 0 disables it.
    #[arg(long, value_name = "PORT")]
    pub http: Option<u16>,

    /// Log directory, overriding General.log_dir when set.
    #[arg(long, value_name = "DIR")]
    pub logs: Option<String>,
}
