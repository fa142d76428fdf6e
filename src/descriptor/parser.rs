//! Descriptor file parser

use super::config::{
    BuildConfig, DescriptorFile, EnvironmentConfig, PortConfig, ServiceConfig, VolumeMountConfig,
};
use super::model::Descriptor;
use crate::error::{KeelError, Result};
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Default descriptor file names, in lookup order
pub const DEFAULT_DESCRIPTOR_FILES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// Name of the variables file read next to the first descriptor
pub const DEFAULT_ENV_FILE: &str = ".env";

/// Descriptor file parser
pub struct DescriptorParser;

impl DescriptorParser {
    /// Find descriptor file in directory
    pub fn find_descriptor_file(dir: &Path) -> Option<PathBuf> {
        DEFAULT_DESCRIPTOR_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.is_file())
    }

    /// Read a descriptor document without normalizing it
    pub fn read_document(path: &Path) -> Result<DescriptorFile> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            KeelError::Parse(format!("Failed to read {}: {}", path.display(), e))
        })?;

        Self::parse_document(&content).map_err(|e| match e {
            KeelError::Parse(msg) => KeelError::Parse(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    /// Parse a descriptor document from a string
    pub fn parse_document(content: &str) -> Result<DescriptorFile> {
        if content.trim().is_empty() {
            return Err(KeelError::Parse("document is empty".to_string()));
        }
        serde_yaml::from_str(content)
            .map_err(|e| KeelError::Parse(format!("Failed to parse YAML: {}", e)))
    }

    /// Parse and normalize a descriptor from a string, without interpolation
    pub fn parse_str(content: &str) -> Result<Descriptor> {
        Descriptor::from_file(Self::parse_document(content)?)
    }

    /// Parse and normalize a single descriptor file, without interpolation
    pub fn parse_file(path: &Path) -> Result<Descriptor> {
        Descriptor::from_file(Self::read_document(path)?)
    }

    /// Read, merge and interpolate several files, then normalize.
    ///
    /// Later files overlay earlier ones.
    pub fn load(paths: &[PathBuf], env: &HashMap<String, String>) -> Result<Descriptor> {
        if paths.is_empty() {
            return Err(KeelError::Parse("no descriptor file given".to_string()));
        }

        let mut document = DescriptorFile::default();
        for path in paths {
            tracing::debug!("Reading descriptor {}", path.display());
            let overlay = Self::read_document(path)?;
            document = Self::merge_documents(document, overlay);
        }

        Self::interpolate(&mut document, env)?;
        Descriptor::from_file(document)
    }

    /// Merge two descriptor documents
    pub fn merge_documents(base: DescriptorFile, overlay: DescriptorFile) -> DescriptorFile {
        let mut result = base;

        if overlay.version.is_some() {
            result.version = overlay.version;
        }

        if overlay.name.is_some() {
            result.name = overlay.name;
        }

        for (name, service) in overlay.services {
            match result.services.remove(&name) {
                Some(existing) => {
                    result
                        .services
                        .insert(name, Self::merge_services(existing, service));
                }
                None => {
                    result.services.insert(name, service);
                }
            }
        }

        for (name, volume) in overlay.volumes {
            // A bare `name:` in the overlay keeps the base attributes
            let keep_base = volume.is_none() && matches!(result.volumes.get(&name), Some(Some(_)));
            if !keep_base {
                result.volumes.insert(name, volume);
            }
        }

        result
    }

    /// Merge two definitions of the same service
    fn merge_services(base: ServiceConfig, overlay: ServiceConfig) -> ServiceConfig {
        let mut result = base;

        if overlay.image.is_some() {
            result.image = overlay.image;
        }
        if overlay.build.is_some() {
            result.build = overlay.build;
        }
        if overlay.ports.is_some() {
            result.ports = overlay.ports;
        }
        if overlay.volumes.is_some() {
            result.volumes = overlay.volumes;
        }
        if overlay.restart.is_some() {
            result.restart = overlay.restart;
        }
        if overlay.depends_on.is_some() {
            result.depends_on = overlay.depends_on;
        }

        result.environment = match (result.environment, overlay.environment) {
            (Some(base_env), Some(overlay_env)) => {
                let mut merged: Vec<(String, String)> = base_env.entries();
                for (key, value) in overlay_env.entries() {
                    match merged.iter_mut().find(|(k, _)| *k == key) {
                        Some(entry) => entry.1 = value,
                        None => merged.push((key, value)),
                    }
                }
                Some(EnvironmentConfig::Map(
                    merged
                        .into_iter()
                        .map(|(k, v)| (k, Some(v)))
                        .collect(),
                ))
            }
            (base_env, None) => base_env,
            (None, overlay_env) => overlay_env,
        };

        result
    }

    /// Load a `.env` style variables file
    pub fn load_env_file(path: &Path) -> Result<HashMap<String, String>> {
        let content = std::fs::read_to_string(path)?;
        Self::parse_env(&content)
    }

    /// Parse `.env` content: `KEY=value` lines, `#` comments, optional
    /// `export ` prefix and surrounding quotes. Unquoted values end at an
    /// inline ` #` comment.
    pub fn parse_env(content: &str) -> Result<HashMap<String, String>> {
        let mut vars = HashMap::new();

        for (idx, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);

            let Some((key, value)) = line.split_once('=') else {
                return Err(KeelError::Parse(format!(
                    "env file line {}: expected KEY=value",
                    idx + 1
                )));
            };

            let key = key.trim();
            if key.is_empty() {
                return Err(KeelError::Parse(format!(
                    "env file line {}: empty variable name",
                    idx + 1
                )));
            }

            vars.insert(key.to_string(), env_value(value.trim()).to_string());
        }

        Ok(vars)
    }

    /// Interpolate variables into every string a service carries.
    ///
    /// Fails on `${VAR:?message}` with VAR unset and on malformed `${...}`.
    pub fn interpolate(document: &mut DescriptorFile, env: &HashMap<String, String>) -> Result<()> {
        if let Some(name) = document.name.as_mut() {
            *name = interpolate_string(name, env)?;
        }

        for service in document.services.values_mut() {
            if let Some(image) = service.image.as_mut() {
                *image = interpolate_string(image, env)?;
            }

            match service.build.as_mut() {
                Some(BuildConfig::Simple(context)) => *context = interpolate_string(context, env)?,
                Some(BuildConfig::Full(full)) => {
                    for field in [full.context.as_mut(), full.dockerfile.as_mut()]
                        .into_iter()
                        .flatten()
                    {
                        *field = interpolate_string(field, env)?;
                    }
                }
                None => {}
            }

            match service.environment.as_mut() {
                Some(EnvironmentConfig::Map(map)) => {
                    for value in map.values_mut() {
                        if let Some(v) = value {
                            *v = interpolate_string(v, env)?;
                        }
                    }
                }
                Some(EnvironmentConfig::Array(arr)) => {
                    for item in arr.iter_mut() {
                        *item = interpolate_string(item, env)?;
                    }
                }
                None => {}
            }

            for port in service.ports.iter_mut().flatten() {
                if let PortConfig::Short(s) = port {
                    *s = interpolate_string(s, env)?;
                }
            }

            for mount in service.volumes.iter_mut().flatten() {
                match mount {
                    VolumeMountConfig::Short(s) => *s = interpolate_string(s, env)?,
                    VolumeMountConfig::Long(long) => {
                        if let Some(source) = long.source.as_mut() {
                            *source = interpolate_string(source, env)?;
                        }
                        long.target = interpolate_string(&long.target, env)?;
                    }
                }
            }

            if let Some(restart) = service.restart.as_mut() {
                *restart = interpolate_string(restart, env)?;
            }
        }

        Ok(())
    }
}

/// Value part of a `.env` line
fn env_value(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(rest) = value.strip_prefix(quote) {
            if let Some(end) = rest.find(quote) {
                return &rest[..end];
            }
        }
    }

    let end = value
        .char_indices()
        .find(|&(i, c)| c == '#' && i > 0 && value[..i].ends_with(char::is_whitespace))
        .map_or(value.len(), |(i, _)| i);
    value[..end].trim_end()
}

fn variable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"\$\$|\$\{([A-Za-z_][A-Za-z0-9_]*)(?:(:?[-?+])([^}]*))?\}|\$([A-Za-z_][A-Za-z0-9_]*)|(\$\{[^}]*\}?)",
        )
        .expect("variable pattern is valid")
    })
}

/// Interpolate variables in a string.
///
/// `${VAR:-default}` falls back when VAR is unset or empty, `${VAR-default}`
/// only when unset. `${VAR:?msg}` and `${VAR?msg}` fail instead, and
/// `${VAR:+alt}` / `${VAR+alt}` give `alt` when VAR is set. `$$` is a literal
/// dollar sign.
pub fn interpolate_string(s: &str, env: &HashMap<String, String>) -> Result<String> {
    if !s.contains('$') {
        return Ok(s.to_string());
    }

    let mut error = None;
    let result = variable_pattern().replace_all(s, |caps: &Captures| {
        if &caps[0] == "$$" {
            return "$".to_string();
        }
        if let Some(bad) = caps.get(5) {
            if error.is_none() {
                error = Some(KeelError::Parse(format!(
                    "invalid interpolation format for '{}'",
                    bad.as_str()
                )));
            }
            return String::new();
        }

        let name = caps
            .get(1)
            .or_else(|| caps.get(4))
            .map_or("", |m| m.as_str());
        let value = env.get(name).map(String::as_str);
        let operator = caps.get(2).map_or("", |m| m.as_str());
        let arg = caps.get(3).map_or("", |m| m.as_str());

        // `:` makes an empty value count as unset
        let set = match value {
            Some(v) => !(operator.starts_with(':') && v.is_empty()),
            None => false,
        };

        match operator.trim_start_matches(':') {
            "-" if !set => arg.to_string(),
            "?" if !set => {
                let message = if arg.is_empty() {
                    "required variable is missing a value"
                } else {
                    arg
                };
                if error.is_none() {
                    error = Some(KeelError::Parse(format!("{}: {}", name, message)));
                }
                String::new()
            }
            "+" if set => arg.to_string(),
            "+" => String::new(),
            _ => match value {
                Some(v) => v.to_string(),
                None => {
                    tracing::warn!("Variable {} is not set, substituting an empty string", name);
                    String::new()
                }
            },
        }
    });

    match error {
        Some(e) => Err(e),
        None => Ok(result.into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_simple_descriptor() {
        let yaml = r#"
services:
  web:
    image: nginx:latest
    ports:
      - "80:80"
  db:
    image: postgres:13
    environment:
      POSTGRES_PASSWORD: secret
"#;

        let descriptor = DescriptorParser::parse_str(yaml).unwrap();
        assert_eq!(descriptor.len(), 2);
        assert!(descriptor.contains_service("web"));
        assert!(descriptor.contains_service("db"));
    }

    #[test]
    fn test_malformed_yaml_is_parse_error() {
        let err = DescriptorParser::parse_str("services: [unclosed").unwrap_err();
        assert!(matches!(err, KeelError::Parse(_)));

        let err = DescriptorParser::parse_str("   \n").unwrap_err();
        assert!(matches!(err, KeelError::Parse(_)));
    }

    #[test]
    fn test_find_descriptor_file_prefers_compose_yaml() {
        let temp = tempdir().unwrap();
        assert!(DescriptorParser::find_descriptor_file(temp.path()).is_none());

        std::fs::write(temp.path().join("docker-compose.yml"), "services: {}\n").unwrap();
        std::fs::write(temp.path().join("compose.yaml"), "services: {}\n").unwrap();

        let found = DescriptorParser::find_descriptor_file(temp.path()).unwrap();
        assert_eq!(found.file_name().unwrap(), "compose.yaml");
    }

    #[test]
    fn test_load_merges_overlay_files() {
        let temp = tempdir().unwrap();
        let base = temp.path().join("compose.yaml");
        let overlay = temp.path().join("compose.override.yaml");

        std::fs::write(
            &base,
            r#"
services:
  app:
    image: app:1
    environment:
      LOG_LEVEL: info
      DB_HOST: db
    ports: ["8000:8000"]
  db:
    image: mysql:8
"#,
        )
        .unwrap();
        std::fs::write(
            &overlay,
            r#"
services:
  app:
    image: app:2
    environment:
      LOG_LEVEL: debug
    depends_on: [db]
"#,
        )
        .unwrap();

        let descriptor =
            DescriptorParser::load(&[base, overlay], &HashMap::new()).unwrap();
        let app = descriptor.service("app").unwrap();
        assert_eq!(app.image_ref("p"), "app:2");
        assert_eq!(app.environment()["LOG_LEVEL"], "debug");
        assert_eq!(app.environment()["DB_HOST"], "db");
        assert_eq!(app.ports().len(), 1);
        assert_eq!(app.dependencies(), &["db".to_string()]);
    }

    #[test]
    fn test_merge_keeps_volume_attributes_on_bare_overlay() {
        let base = DescriptorParser::parse_document("volumes:\n  data:\n    driver: nfs\n").unwrap();
        let overlay = DescriptorParser::parse_document("volumes:\n  data:\n  logs:\n").unwrap();
        let merged = DescriptorParser::merge_documents(base, overlay);
        assert_eq!(
            merged.volumes["data"].as_ref().and_then(|v| v.driver.as_deref()),
            Some("nfs")
        );
        assert!(merged.volumes.contains_key("logs"));
    }

    #[test]
    fn test_load_reports_missing_file() {
        let temp = tempdir().unwrap();
        let err = DescriptorParser::load(&[temp.path().join("nope.yaml")], &HashMap::new())
            .unwrap_err();
        assert!(matches!(err, KeelError::Parse(_)));
    }

    #[test]
    fn test_interpolate() {
        let vars = env(&[("TAG", "1.0.0"), ("EMPTY", "")]);

        assert_eq!(interpolate_string("nginx:${TAG}", &vars).unwrap(), "nginx:1.0.0");
        assert_eq!(interpolate_string("nginx:$TAG", &vars).unwrap(), "nginx:1.0.0");
        assert_eq!(interpolate_string("${MISSING:-fallback}", &vars).unwrap(), "fallback");
        assert_eq!(interpolate_string("${EMPTY:-fallback}", &vars).unwrap(), "fallback");
        assert_eq!(interpolate_string("${EMPTY-fallback}", &vars).unwrap(), "");
        assert_eq!(interpolate_string("${MISSING-fallback}", &vars).unwrap(), "fallback");
        assert_eq!(interpolate_string("cost $$5", &vars).unwrap(), "cost $5");
        assert_eq!(interpolate_string("${MISSING}x", &vars).unwrap(), "x");
    }

    #[test]
    fn test_interpolate_required_and_alternate() {
        let vars = env(&[("TAG", "1.0.0"), ("EMPTY", "")]);

        assert_eq!(interpolate_string("${TAG:?tag needed}", &vars).unwrap(), "1.0.0");
        assert_eq!(interpolate_string("${EMPTY?}", &vars).unwrap(), "");
        assert_eq!(interpolate_string("${TAG:+pinned}", &vars).unwrap(), "pinned");
        assert_eq!(interpolate_string("${EMPTY:+pinned}", &vars).unwrap(), "");
        assert_eq!(interpolate_string("${EMPTY+pinned}", &vars).unwrap(), "pinned");
        assert_eq!(interpolate_string("${MISSING+pinned}", &vars).unwrap(), "");

        let err = interpolate_string("${MISSING:?set MISSING first}", &vars).unwrap_err();
        assert!(matches!(err, KeelError::Parse(ref msg) if msg.contains("set MISSING first")));
        assert!(interpolate_string("${EMPTY:?}", &vars).is_err());
    }

    #[test]
    fn test_interpolate_rejects_malformed_braces() {
        let vars = env(&[("TAG", "1")]);
        assert!(interpolate_string("${TAG:x}", &vars).is_err());
        assert!(interpolate_string("${1TAG}", &vars).is_err());
        assert!(interpolate_string("nginx:${TAG", &vars).is_err());
    }

    #[test]
    fn test_load_fails_on_required_variable() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("compose.yaml");
        std::fs::write(&path, "services:\n  app:\n    image: \"app:${TAG:?TAG is required}\"\n")
            .unwrap();

        let err = DescriptorParser::load(&[path], &HashMap::new()).unwrap_err();
        assert!(err.is_config_error());
        assert!(err.to_string().contains("TAG is required"));
    }

    #[test]
    fn test_interpolate_does_not_clobber_prefixed_names() {
        let vars = env(&[("DB", "mysql"), ("DB_PORT", "3306")]);
        assert_eq!(interpolate_string("$DB_PORT", &vars).unwrap(), "3306");
        assert_eq!(interpolate_string("${DB}:${DB_PORT}", &vars).unwrap(), "mysql:3306");
    }

    #[test]
    fn test_interpolate_document_fields() {
        let mut document = DescriptorParser::parse_document(
            r#"
services:
  app:
    image: "registry/app:${TAG:-latest}"
    environment:
      DATABASE_URL: "mysql://${DB_USER}@db/app"
    ports: ["${APP_PORT:-8000}:8000"]
    volumes: ["${DATA_VOLUME}:/data"]
"#,
        )
        .unwrap();

        DescriptorParser::interpolate(
            &mut document,
            &env(&[("DB_USER", "user"), ("DATA_VOLUME", "appdata")]),
        )
        .unwrap();
        let descriptor = Descriptor::from_file(document).unwrap();
        let app = descriptor.service("app").unwrap();

        assert_eq!(app.image_ref("p"), "registry/app:latest");
        assert_eq!(app.environment()["DATABASE_URL"], "mysql://user@db/app");
        assert_eq!(app.ports()[0].host_port, Some(8000));
        assert_eq!(app.volume_mounts()[0].volume_name(), Some("appdata"));
    }

    #[test]
    fn test_parse_env() {
        let vars = DescriptorParser::parse_env(
            "# comment\n\nexport TAG=1.2\nPASSWORD=\"s3cret\"\nNAME='app'\nEMPTY=\n",
        )
        .unwrap();
        let expected: BTreeMap<_, _> = [
            ("EMPTY", ""),
            ("NAME", "app"),
            ("PASSWORD", "s3cret"),
            ("TAG", "1.2"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        assert_eq!(vars.into_iter().collect::<BTreeMap<_, _>>(), expected);

        assert!(DescriptorParser::parse_env("NOT_AN_ASSIGNMENT\n").is_err());
    }

    #[test]
    fn test_parse_env_inline_comments() {
        let vars = DescriptorParser::parse_env(
            "TAG=1.2 # pinned\nCOLOR=#fff\nURL=http://x/#frag\nQUOTED=\"a # b\" # note\nSINGLE='x' #c\n",
        )
        .unwrap();
        assert_eq!(vars["TAG"], "1.2");
        assert_eq!(vars["COLOR"], "#fff");
        assert_eq!(vars["URL"], "http://x/#frag");
        assert_eq!(vars["QUOTED"], "a # b");
        assert_eq!(vars["SINGLE"], "x");
    }

    #[test]
    fn test_load_env_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join(DEFAULT_ENV_FILE);
        std::fs::write(&path, "TAG=2\n").unwrap();
        let vars = DescriptorParser::load_env_file(&path).unwrap();
        assert_eq!(vars["TAG"], "2");
    }
}
