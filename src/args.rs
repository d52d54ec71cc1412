use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// The URL of the file to download, or a path to a file containing one
    /// mirror URL per line. Blank lines are ignored.
    pub input: String,

    /// Max connections to open in parallel for the file.
    #[arg(default_value_t = 1, value_name = "MAX-CONCURRENT-CONNECTIONS")]
    pub connections: u64,
}
