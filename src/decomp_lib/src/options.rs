//! Configurable options of an [`Architecture`](crate::architecture::Architecture).
//!
//! Options are keyed by name and applied immediately; they persist for the
//! life of the architecture object.

use crate::prelude::*;

/// How comments are emitted by a downstream printer.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy, Default)]
pub enum CommentStyle {
    /// `/* ... */`
    #[default]
    C,
    /// `// ...`
    Cpp,
}

/// The option values of one architecture.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct Options {
    /// Name of the prototype model assumed for unknown functions.
    pub default_prototype: String,
    /// Trim extensions even when the trimmed value provably changes
    /// (cosmetic aggressiveness).
    pub aggressive_trim: bool,
    /// Smallest constant the pointer-arithmetic rules may turn into an
    /// address reference.
    pub infer_pointer_bound: u64,
    /// Required alignment of function pointers, a power of two.
    pub funcptr_align: u32,
    /// Maximum characters per line for a downstream printer.
    pub max_line_width: u32,
    /// Comment style for a downstream printer.
    pub comment_style: CommentStyle,
    /// Names of the action groups enabled for the current root action.
    pub allowed_actions: Vec<String>,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            default_prototype: "default".to_string(),
            aggressive_trim: false,
            infer_pointer_bound: 0x1000,
            funcptr_align: 1,
            max_line_width: 100,
            comment_style: CommentStyle::C,
            allowed_actions: Vec::new(),
        }
    }
}

impl Options {
    /// Applies the option with the given key.
    ///
    /// The recognized keys mirror the option names of the configuration
    /// interface; unknown keys and malformed values are errors. Range-valued
    /// options (read-only and volatile memory) are applied through
    /// [`Architecture::set_option`](crate::architecture::Architecture::set_option)
    /// because they modify the database.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), Error> {
        match key {
            "defaultprototype" => {
                self.default_prototype = value.to_string();
            }
            "aggressivetrim" => {
                self.aggressive_trim = parse_bool(value)?;
            }
            "inferconstptr" => {
                self.infer_pointer_bound = parse_u64(value)?;
            }
            "funcptralign" => {
                let align = parse_u64(value)? as u32;
                if !align.is_power_of_two() {
                    bail!("function pointer alignment must be a power of two");
                }
                self.funcptr_align = align;
            }
            "maxlinewidth" => {
                self.max_line_width = parse_u64(value)? as u32;
            }
            "commentstyle" => {
                self.comment_style = match value {
                    "c" => CommentStyle::C,
                    "cplusplus" => CommentStyle::Cpp,
                    _ => bail!("unknown comment style: {}", value),
                };
            }
            "allowedactions" => {
                self.allowed_actions = value
                    .split(',')
                    .map(|name| name.trim().to_string())
                    .filter(|name| !name.is_empty())
                    .collect();
            }
            _ => bail!("unknown option key: {}", key),
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> Result<bool, Error> {
    match value {
        "on" | "true" | "yes" => Ok(true),
        "off" | "false" | "no" => Ok(false),
        _ => bail!("expected boolean option value, got: {}", value),
    }
}

fn parse_u64(value: &str) -> Result<u64, Error> {
    let parsed = if let Some(hex) = value.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else {
        value.parse()
    };
    parsed.map_err(|_| anyhow!("expected integer option value, got: {}", value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_keys() {
        let mut options = Options::default();
        options.set("aggressivetrim", "on").unwrap();
        assert!(options.aggressive_trim);
        options.set("inferconstptr", "0x10000").unwrap();
        assert_eq!(options.infer_pointer_bound, 0x10000);
        options.set("allowedactions", "base, deadcode").unwrap();
        assert_eq!(options.allowed_actions, vec!["base", "deadcode"]);
        assert!(options.set("funcptralign", "3").is_err());
        assert!(options.set("nosuchkey", "1").is_err());
    }
}
