use crossterm::style::Stylize;

/// Print a success marker to stderr, keeping stdout free for remote output.
pub fn success(msg: &str) {
    eprintln!("{} {msg}", "Success:".green().bold());
}

/// Print a failure marker to stderr.
pub fn failure(msg: &str) {
    eprintln!("{} {msg}", "ERROR:".red().bold());
}

/// Report a failure and exit with a non-zero status.
pub fn fatal(msg: &str) -> ! {
    failure(msg);
    std::process::exit(1);
}
