// src/configfile.rs
// Reads the INI-style printer configuration that holds the [probe] section.

use std::collections::HashMap;
use std::path::Path;

use crate::error::ConfigError;

#[derive(Debug, Default, Clone)]
pub struct Configfile {
    // section -> { option -> raw value }, names stored lowercase
    data: HashMap<String, HashMap<String, String>>,
}

impl Configfile {
    pub fn new() -> Self {
        Configfile { data: HashMap::new() }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::ValidationError(format!("Unable to read config file {}: {}", path.display(), e))
        })?;
        let mut cf = Configfile::new();
        cf.parse(&content)?;
        Ok(cf)
    }

    /// Parses `key = value` or `key: value` lines grouped under `[section]` headers.
    /// Text after `#` or `;` is a comment.
    pub fn parse(&mut self, content: &str) -> Result<(), ConfigError> {
        self.data.clear();
        let mut current: Option<String> = None;

        for raw in content.lines() {
            let line = match raw.find(|c| c == '#' || c == ';') {
                Some(idx) => &raw[..idx],
                None => raw,
            }
            .trim();
            if line.is_empty() {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                let name = line[1..line.len() - 1].trim().to_lowercase();
                if name.is_empty() {
                    return Err(ConfigError::ValidationError("Empty section name found".to_string()));
                }
                self.data.entry(name.clone()).or_default();
                current = Some(name);
                continue;
            }

            let section = current
                .as_ref()
                .ok_or_else(|| ConfigError::ValidationError(format!("Line outside of section: {}", raw)))?;
            let (key, value) = line
                .split_once('=')
                .or_else(|| line.split_once(':'))
                .ok_or_else(|| ConfigError::ValidationError(format!("Malformed line in section [{}]: {}", section, raw)))?;
            let key = key.trim().to_lowercase();
            if key.is_empty() {
                return Err(ConfigError::ValidationError(format!("Empty key found in section [{}]", section)));
            }
            self.data
                .entry(section.clone())
                .or_default()
                .insert(key, value.trim().to_string());
        }
        Ok(())
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.data.contains_key(&section.to_lowercase())
    }

    pub fn has_option(&self, section: &str, option: &str) -> bool {
        self.get_str(section, option).is_ok()
    }

    fn get_str(&self, section: &str, option: &str) -> Result<&String, ConfigError> {
        self.data
            .get(&section.to_lowercase())
            .ok_or_else(|| ConfigError::SectionNotFound(section.to_string()))?
            .get(&option.to_lowercase())
            .ok_or_else(|| ConfigError::OptionNotFound(section.to_string(), option.to_string()))
    }

    // Missing option falls back to the default, everything else propagates.
    fn lookup<T>(
        &self,
        section: &str,
        option: &str,
        default: Option<T>,
        parse: impl FnOnce(&String) -> Result<T, ConfigError>,
    ) -> Result<T, ConfigError> {
        match self.get_str(section, option) {
            Ok(raw) => parse(raw),
            Err(ConfigError::OptionNotFound(..)) => {
                default.ok_or_else(|| ConfigError::OptionNotFound(section.to_string(), option.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    pub fn get(&self, section: &str, option: &str, default: Option<&str>) -> Result<String, ConfigError> {
        self.lookup(section, option, default.map(str::to_string), |raw| Ok(raw.clone()))
    }

    pub fn getfloat(
        &self,
        section: &str,
        option: &str,
        default: Option<f64>,
        minval: Option<f64>,
        maxval: Option<f64>,
    ) -> Result<f64, ConfigError> {
        let value = self.lookup(section, option, default, |raw| {
            raw.parse::<f64>()
                .map_err(|_| ConfigError::ParseError(option.to_string(), raw.clone(), "float".to_string()))
        })?;
        check_range(section, option, value, minval, maxval)?;
        Ok(value)
    }

    pub fn getint(
        &self,
        section: &str,
        option: &str,
        default: Option<i64>,
        minval: Option<i64>,
        maxval: Option<i64>,
    ) -> Result<i64, ConfigError> {
        let value = self.lookup(section, option, default, |raw| {
            raw.parse::<i64>()
                .map_err(|_| ConfigError::ParseError(option.to_string(), raw.clone(), "integer".to_string()))
        })?;
        check_range(section, option, value, minval, maxval)?;
        Ok(value)
    }

    pub fn getboolean(&self, section: &str, option: &str, default: Option<bool>) -> Result<bool, ConfigError> {
        self.lookup(section, option, default, |raw| match raw.to_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(true),
            "false" | "no" | "off" | "0" => Ok(false),
            _ => Err(ConfigError::ParseError(option.to_string(), raw.clone(), "boolean".to_string())),
        })
    }

    pub fn getchoice(
        &self,
        section: &str,
        option: &str,
        choices: &[&str],
        default: Option<&str>,
    ) -> Result<String, ConfigError> {
        let value = self.get(section, option, default)?.to_lowercase();
        if !choices.contains(&value.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Choice '{}' for option '{}' in section '[{}]' is not a valid choice",
                value, option, section
            )));
        }
        Ok(value)
    }

    /// Comma separated list of floats, e.g. `10.0, 20.0, 0.2`.
    pub fn getfloatlist(
        &self,
        section: &str,
        option: &str,
        default: Option<Vec<f64>>,
    ) -> Result<Vec<f64>, ConfigError> {
        self.lookup(section, option, default, |raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<f64>()
                        .map_err(|_| ConfigError::ParseError(option.to_string(), raw.clone(), "float list".to_string()))
                })
                .collect()
        })
    }

    #[cfg(test)]
    pub fn set(&mut self, section: &str, option: &str, value: &str) {
        self.data
            .entry(section.to_lowercase())
            .or_default()
            .insert(option.to_lowercase(), value.to_string());
    }
}

fn check_range<T: PartialOrd + std::fmt::Display>(
    section: &str,
    option: &str,
    value: T,
    minval: Option<T>,
    maxval: Option<T>,
) -> Result<(), ConfigError> {
    if let Some(min) = minval {
        if value < min {
            return Err(ConfigError::ValidationError(format!(
                "Option '{}' in section '[{}]' ({}) must be >= {}",
                option, section, value, min
            )));
        }
    }
    if let Some(max) = maxval {
        if value > max {
            return Err(ConfigError::ValidationError(format!(
                "Option '{}' in section '[{}]' ({}) must be <= {}",
                option, section, value, max
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(content: &str) -> Configfile {
        let mut cf = Configfile::new();
        cf.parse(content).unwrap();
        cf
    }

    #[test]
    fn test_parse_probe_section() {
        let cf = parsed("[probe]\nz_offset = -1.5\nmechanism: servo\n\n[printer]\nmax_x=220");
        assert_eq!(cf.getfloat("probe", "z_offset", None, None, None).unwrap(), -1.5);
        assert_eq!(cf.get("PROBE", "MECHANISM", None).unwrap(), "servo");
        assert_eq!(cf.getint("printer", "max_x", None, None, None).unwrap(), 220);
    }

    #[test]
    fn test_comments_and_defaults() {
        let cf = parsed(
            r#"
# leading comment
[probe] ; trailing comment
  samples = 3 # three samples
  ; speed = 9
"#,
        );
        assert_eq!(cf.getint("probe", "samples", None, None, None).unwrap(), 3);
        assert_eq!(cf.getfloat("probe", "speed", Some(5.0), None, None).unwrap(), 5.0);
        assert!(cf.getfloat("probe", "z_offset", None, None, None).is_err());
        assert!(matches!(
            cf.get("bed_mesh", "x", None),
            Err(ConfigError::SectionNotFound(_))
        ));
    }

    #[test]
    fn test_range_validation() {
        let cf = parsed("[probe]\nspeed = 0");
        let err = cf.getfloat("probe", "speed", None, Some(0.1), None).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(ref msg) if msg.contains("must be >= 0.1")));
    }

    #[test]
    fn test_booleans_and_choices() {
        let cf = parsed("[probe]\na=Yes\nb=off\nc=maybe\nmechanism=Sled");
        assert!(cf.getboolean("probe", "a", None).unwrap());
        assert!(!cf.getboolean("probe", "b", None).unwrap());
        assert!(cf.getboolean("probe", "c", None).is_err());
        assert_eq!(cf.getchoice("probe", "mechanism", &["fixed", "sled"], None).unwrap(), "sled");
        assert!(cf.getchoice("probe", "mechanism", &["fixed"], None).is_err());
    }

    #[test]
    fn test_float_list() {
        let cf = parsed("[probe]\ndeploy_1 = 30, 0.5 ,10,3000\nbad = 1,x");
        assert_eq!(
            cf.getfloatlist("probe", "deploy_1", None).unwrap(),
            vec![30.0, 0.5, 10.0, 3000.0]
        );
        assert!(cf.getfloatlist("probe", "bad", None).is_err());
        assert_eq!(cf.getfloatlist("probe", "missing", Some(vec![])).unwrap(), Vec::<f64>::new());
    }

    #[test]
    fn test_parse_errors() {
        assert!(Configfile::new().parse("[]\nkey=val").is_err());
        assert!(Configfile::new().parse("[sec]\n=val").is_err());
        assert!(Configfile::new().parse("[sec]\njustavalue").is_err());
        assert!(Configfile::new().parse("key=val").is_err());
    }
}
