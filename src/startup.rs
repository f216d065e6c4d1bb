// Startup module - displays banner and module loading status
//
// Runs once before the server starts: version info, config source, the
// modules in play, and the bind address.

use crate::config::{Config, VERSION};

/// ANSI color codes for terminal output
mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BOLD: &str = "\x1b[1m";
    pub const DIM: &str = "\x1b[2m";
    pub const CYAN: &str = "\x1b[36m";
    pub const GREEN: &str = "\x1b[32m";
    pub const YELLOW: &str = "\x1b[33m";
    pub const MAGENTA: &str = "\x1b[35m";
}

/// Module loading result for display
pub struct ModuleStatus {
    pub name: &'static str,
    pub enabled: bool,
    pub description: &'static str,
}

/// Print the startup banner and module loading status
pub fn print_startup(config: &Config) {
    use colors::*;

    // Banner
    println!();
    println!("  {BOLD}{CYAN}lmgate{RESET} {DIM}v{VERSION}{RESET}");
    println!("  {DIM}LAN gateway for a local LM Studio-style runtime{RESET}");
    println!();

    // Config file status
    if let Some(path) = Config::config_path() {
        if path.exists() {
            println!("  {DIM}Config:{RESET} {GREEN}✓{RESET} {}", path.display());
        } else {
            println!("  {DIM}Config:{RESET} {DIM}(using defaults){RESET}");
        }
    }
    println!();

    // Module loading
    println!("  {DIM}Loading modules...{RESET}");

    let modules = get_module_status(config);
    for module in &modules {
        print_module_status(module);
    }

    println!();

    // Gateway info
    println!(
        "  {MAGENTA}▸{RESET} Gateway listening on {BOLD}{}{RESET}",
        config.bind_addr()
    );
    println!(
        "  {MAGENTA}▸{RESET} Backend at {BOLD}{}{RESET} {DIM}(control: {}){RESET}",
        config.backend_url, config.control_url
    );
    if config.shared_secret.is_empty() {
        println!("  {YELLOW}▸{RESET} {YELLOW}Auth disabled{RESET} {DIM}(no shared secret configured){RESET}");
    }
    println!();
}

/// Get status of all modules based on config
fn get_module_status(config: &Config) -> Vec<ModuleStatus> {
    vec![
        ModuleStatus {
            name: "proxy",
            enabled: true, // Core, always on
            description: "OpenAI-compatible forwarding",
        },
        ModuleStatus {
            name: "control",
            enabled: true, // Core, always on
            description: "Model load/unload channel",
        },
        ModuleStatus {
            name: "stream",
            enabled: true, // Core, always on
            description: "SSE debug stream",
        },
        ModuleStatus {
            name: "auth",
            enabled: !config.shared_secret.is_empty(),
            description: "Shared-secret check",
        },
        ModuleStatus {
            name: "allowlist",
            enabled: !config.allowlist.iter().any(|e| e == "*"),
            description: "Source filtering",
        },
        ModuleStatus {
            name: "tailer",
            enabled: config.enable_log_monitoring,
            description: "Backend log monitoring",
        },
    ]
}

/// Print a single module's status
fn print_module_status(module: &ModuleStatus) {
    use colors::*;

    let (icon, style) = if module.enabled {
        (format!("{GREEN}✓{RESET}"), "")
    } else {
        (format!("{DIM}○{RESET}"), DIM)
    };

    println!(
        "    {icon} {style}{:<12}{RESET} {DIM}{}{RESET}",
        module.name, module.description
    );
}
