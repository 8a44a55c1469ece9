use anyhow::{anyhow, Context, Result};
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

const PROJECT_CONFIG_NAME: &str = ".sluicerc";
const MAX_ALIAS_DEPTH: usize = 10;

/// Subcommands that may carry their own `[section]` with `defaults`
pub const SUBCOMMANDS: &[&str] = &["run", "reconcile", "watch"];

/// Configuration file handler for sluice
///
/// ```ini
/// # inserted right after the program name
/// defaults = -v
///
/// [run]
/// # inserted right after `run`
/// defaults = --concurrency 8 --tolerate-failures
///
/// [aliases]
/// nightly = run ./incoming ./done --skip-existing
/// ```
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConfigFile {
    pub defaults: Option<String>,
    pub command_defaults: HashMap<String, String>,
    pub aliases: HashMap<String, String>,
}

impl ConfigFile {
    /// Find project-level .sluicerc by walking up directory tree
    pub fn find_project_config() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;
        Self::find_project_config_from(&current)
    }

    pub fn find_project_config_from(start: &Path) -> Option<PathBuf> {
        let mut current = start.to_path_buf();
        loop {
            let config_path = current.join(PROJECT_CONFIG_NAME);
            if config_path.exists() {
                return Some(config_path);
            }
            if !current.pop() {
                // Reached filesystem root
                break;
            }
        }
        None
    }

    /// Get list of user config file locations in order of preference
    pub fn get_user_config_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        // $XDG_CONFIG_HOME/sluice/config.ini, %APPDATA%\sluice\config.ini on Windows
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("sluice").join("config.ini"));
        }
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(PROJECT_CONFIG_NAME));
        }
        paths
    }

    /// Load configuration with proper precedence: project > user > defaults
    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        // First, load user config files (lowest precedence)
        if let Some(path) = Self::get_user_config_paths().into_iter().find(|p| p.exists()) {
            let user_config = Self::load_from_path(&path)?;
            config = Self::merge_configs(config, user_config);
        }

        // Then, load project config (higher precedence)
        if let Some(project_path) = Self::find_project_config() {
            let project_config = Self::load_from_path(&project_path)?;
            config = Self::merge_configs(config, project_config);
        }

        Ok(config)
    }

    /// Load configuration with optional custom config file path
    pub fn load_with_custom_path(custom_path: Option<&str>) -> Result<Self> {
        match custom_path {
            Some(path) => Self::load_from_path(Path::new(path)),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse_ini_content(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse INI content from string
    fn parse_ini_content(content: &str) -> Result<Self> {
        let mut config = Self::default();
        let mut current_section = String::new();

        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();

            // Skip empty lines and comments
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                current_section = line[1..line.len() - 1].trim().to_string();
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(anyhow!("line {}: expected 'key = value'", line_no + 1));
            };
            let key = key.trim();
            let value = value.trim().to_string();

            match current_section.as_str() {
                "" if key == "defaults" => config.defaults = Some(value),
                "aliases" => {
                    config.aliases.insert(key.to_string(), value);
                }
                section if key == "defaults" && SUBCOMMANDS.contains(&section) => {
                    config.command_defaults.insert(section.to_string(), value);
                }
                _ => {
                    // Ignore unknown keys and sections
                }
            }
        }

        Ok(config)
    }

    /// Merge two configuration objects, with the second taking precedence
    fn merge_configs(base: Self, overlay: Self) -> Self {
        let mut command_defaults = base.command_defaults;
        command_defaults.extend(overlay.command_defaults);
        let mut aliases = base.aliases;
        aliases.extend(overlay.aliases);

        Self {
            defaults: overlay.defaults.or(base.defaults),
            command_defaults,
            aliases,
        }
    }

    /// Describe where configuration comes from, for `--show-config`
    pub fn describe(custom_path: Option<&str>) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Configuration precedence: CLI > --config-file > project .sluicerc > user config > defaults\n"
        );

        let loaded = match custom_path {
            Some(path) => {
                let _ = writeln!(out, "Configuration file: {}", path);
                Self::load_from_path(Path::new(path))
            }
            None => {
                let project = Self::find_project_config();
                let user_paths = Self::get_user_config_paths();
                let _ = writeln!(out, "Configuration search locations (in precedence order):");
                match &project {
                    Some(path) => {
                        let _ = writeln!(out, "  1. Project: {} (found)", path.display());
                    }
                    None => {
                        let _ = writeln!(
                            out,
                            "  1. Project: {} (searched up directory tree, not found)",
                            PROJECT_CONFIG_NAME
                        );
                    }
                }
                for (i, path) in user_paths.iter().enumerate() {
                    let status = if path.exists() { "(found)" } else { "(not found)" };
                    let _ = writeln!(out, "  {}. User: {} {}", i + 2, path.display(), status);
                }
                Self::load()
            }
        };

        match loaded {
            Ok(config) => {
                if config == Self::default() {
                    let _ = writeln!(out, "\nNo configuration found. Using defaults.");
                    return out;
                }
                if let Some(defaults) = &config.defaults {
                    let _ = writeln!(out, "\nActive defaults:\n  defaults = {}", defaults);
                }
                for command in SUBCOMMANDS {
                    if let Some(defaults) = config.command_defaults.get(*command) {
                        let _ = writeln!(out, "\n[{}]\n  defaults = {}", command, defaults);
                    }
                }
                if !config.aliases.is_empty() {
                    let _ = writeln!(out, "\nActive aliases:");
                    let mut sorted_aliases: Vec<_> = config.aliases.iter().collect();
                    sorted_aliases.sort_by_key(|(k, _)| k.as_str());
                    for (key, value) in sorted_aliases {
                        let _ = writeln!(out, "  {} = {}", key, value);
                    }
                }
            }
            Err(e) => {
                let _ = writeln!(out, "\nError loading configuration: {:#}", e);
            }
        }
        out
    }

    /// Resolve a single alias, handling recursive references
    pub fn resolve_alias(
        &self,
        name: &str,
        seen: &mut HashSet<String>,
        depth: usize,
    ) -> Result<Vec<String>> {
        if depth > MAX_ALIAS_DEPTH {
            return Err(anyhow!("Alias chain too deep: {} levels", depth));
        }

        if seen.contains(name) {
            return Err(anyhow!("Circular dependency detected in alias: {}", name));
        }

        let alias_value = self
            .aliases
            .get(name)
            .ok_or_else(|| anyhow!("Unknown alias: {}", name))?;

        seen.insert(name.to_string());

        // Split the alias value into args using shell-like parsing
        let args = shell_words::split(alias_value)
            .with_context(|| format!("Invalid alias '{}': failed to parse arguments", name))?;
        let result = self.expand_aliases(args, seen, depth + 1)?;

        seen.remove(name);
        Ok(result)
    }

    fn expand_aliases(
        &self,
        args: Vec<String>,
        seen: &mut HashSet<String>,
        depth: usize,
    ) -> Result<Vec<String>> {
        let mut result = Vec::with_capacity(args.len());
        let mut i = 0;

        while i < args.len() {
            if (args[i] == "-a" || args[i] == "--alias") && i + 1 < args.len() {
                let resolved = self.resolve_alias(&args[i + 1], seen, depth)?;
                result.extend(resolved);
                i += 2;
            } else {
                result.push(args[i].clone());
                i += 1;
            }
        }

        Ok(result)
    }

    /// Process command line arguments, expanding aliases and applying defaults
    ///
    /// Root `defaults` go right after the program name; a subcommand's
    /// `defaults` go right after the subcommand, so explicit arguments that
    /// follow still win.
    pub fn process_args(&self, args: Vec<String>) -> Result<Vec<String>> {
        let mut args = args.into_iter();
        let mut with_defaults = Vec::new();
        if let Some(program) = args.next() {
            with_defaults.push(program);
        }
        if let Some(defaults) = &self.defaults {
            let default_args = shell_words::split(defaults)
                .context("Invalid defaults: failed to parse arguments")?;
            with_defaults.extend(default_args);
        }
        with_defaults.extend(args);

        let expanded = self.expand_aliases(with_defaults, &mut HashSet::new(), 0)?;

        let mut result = Vec::with_capacity(expanded.len());
        let mut subcommand_seen = false;
        for (i, arg) in expanded.into_iter().enumerate() {
            let is_subcommand = i > 0 && !subcommand_seen && SUBCOMMANDS.contains(&arg.as_str());
            let command_defaults = if is_subcommand {
                subcommand_seen = true;
                self.command_defaults.get(&arg).cloned()
            } else {
                None
            };
            result.push(arg);

            if let Some(defaults) = command_defaults {
                let default_args = shell_words::split(&defaults)
                    .context("Invalid subcommand defaults: failed to parse arguments")?;
                result.extend(self.expand_aliases(default_args, &mut HashSet::new(), 0)?);
            }
        }

        Ok(result)
    }
}
