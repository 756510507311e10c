use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[clap(about = "A compiler back end lowering IR3 programs to IR2")]
pub struct Options {
    #[clap(subcommand)]
    pub operation: Operation,
}

#[derive(Debug, Subcommand)]
pub enum Operation {
    /// Check a program for errors
    Check { file: String },
    /// Compile a program to IR2
    Compile {
        file: String,
        /// Path of the IR2 output file
        #[clap(short, long)]
        output: Option<String>,
    },
}
