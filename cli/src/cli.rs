use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "tango")]
#[command(version)]
#[command(about = "Client for the Tango job-execution broker", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(
        short,
        long,
        global = true,
        default_value = "http://localhost:3000",
        help = "Server base URL"
    )]
    pub server: String,

    #[arg(
        short,
        long,
        global = true,
        default_value = "test",
        help = "Requester access key"
    )]
    pub key: String,

    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Create the requester directory and list known files")]
    Open,

    #[command(about = "Upload a file")]
    Upload {
        #[arg(value_name = "FILE", help = "Local file to upload")]
        file: PathBuf,

        #[arg(short, long, help = "Name to store the file under")]
        name: Option<String>,
    },

    #[command(about = "Submit a job")]
    Addjob {
        #[arg(short, long, help = "Image to run the job in")]
        image: String,

        #[arg(
            short = 'f',
            long = "file",
            value_name = "LOCAL[:DEST]",
            help = "Uploaded file to copy in; repeatable, one must land as Makefile"
        )]
        files: Vec<String>,

        #[arg(short, long, help = "Output destination name")]
        output: String,

        #[arg(short, long, default_value_t = 60, help = "Run timeout in seconds")]
        timeout: u64,

        #[arg(long, help = "Job name (generated when omitted)")]
        name: Option<String>,

        #[arg(long, help = "URL to POST the completion status to")]
        notify_url: Option<String>,
    },

    #[command(about = "Fetch the captured output for a destination name")]
    Poll {
        #[arg(value_name = "DEST", help = "Output destination name")]
        dest: String,
    },

    #[command(about = "Show broker counters")]
    Info,

    #[command(about = "List jobs")]
    Jobs {
        #[arg(long, help = "List completed jobs instead of live ones")]
        dead: bool,
    },

    #[command(about = "Show pool state")]
    Pool {
        #[arg(value_name = "IMAGE", help = "Limit to one image")]
        image: Option<String>,
    },

    #[command(about = "Resize the warm pool for an image")]
    Prealloc {
        #[arg(value_name = "IMAGE")]
        image: String,

        #[arg(value_name = "COUNT")]
        count: usize,
    },

    #[command(about = "Request cancellation of a live job")]
    Cancel {
        #[arg(value_name = "ID")]
        id: u64,
    },

    #[command(about = "Delete a job record")]
    Deljob {
        #[arg(value_name = "ID")]
        id: u64,

        #[arg(long, help = "Delete from the completed ring")]
        dead: bool,
    },
}
