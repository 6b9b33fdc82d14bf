//! Formatted output utilities.

use console::{Style, style};

/// Print a success message with checkmark.
pub fn success(msg: &str) {
    println!("{} {}", style("✓").green().bold(), msg);
}

/// Print an error message with X.
pub fn error(msg: &str) {
    println!("{} {}", style("✗").red().bold(), msg);
}

/// Print a warning message.
pub fn warning(msg: &str) {
    println!("{} {}", style("⚠").yellow().bold(), msg);
}

/// Print an info message.
pub fn info(msg: &str) {
    println!("{} {}", style("ℹ").blue().bold(), msg);
}

/// Print a header/section title.
pub fn header(msg: &str) {
    println!("\n{}", style(msg).bold().underlined());
}

/// Print a key-value pair.
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", style(key).bold(), value);
}

/// Print a table row.
pub fn table_row(cols: &[(&str, usize)]) {
    for (text, width) in cols {
        print!("{text:width$}");
    }
    println!();
}

/// Outcome of a security-gate dry run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    NeedsApproval,
    Denied,
}

/// Print a gate verdict with its detail.
pub fn verdict(subject: &str, verdict: Verdict, detail: &str) {
    let (icon, label_style, label) = match verdict {
        Verdict::Allowed => (style("✓").green(), Style::new().green(), "ALLOWED"),
        Verdict::NeedsApproval => (style("?").yellow(), Style::new().yellow(), "NEEDS APPROVAL"),
        Verdict::Denied => (style("✗").red(), Style::new().red(), "DENIED"),
    };

    print!("  {icon} {subject}: {}", label_style.apply_to(label));
    if !detail.is_empty() {
        print!(" - {}", style(detail).dim());
    }
    println!();
}
