//! Command line client for EXTJWT tokens.
//!
//! Connects to a chat server, requests upload tokens the way the file uploader does, and prints
//! them. Useful to check whether a server hands out tokens at all, and how they are cached.

#![warn(missing_debug_implementations, unused_crate_dependencies, clippy::all)]

mod cli;
mod irc;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
