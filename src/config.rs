// Copyright 2022 Xcalibyte Limited
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::Path;

use ini::Ini;

use crate::errors::*;

/// Properties file name used throughout the output archive; the scanner
/// looks it up by this exact name.
pub const PROPERTIES_FILE_NAME: &str = "xcalibyte.properties";

#[cfg(windows)]
const PLATFORM_SECTION: &str = "windows";
#[cfg(not(windows))]
const PLATFORM_SECTION: &str = "linux";

/// Installation-wide settings from `<tool-root>/config`, with built-in
/// defaults when the file or a key is absent.
#[derive(Default, Debug)]
pub struct Config {
    ini: Option<Ini>,
}

impl Config {
    /// Load `<tool-root>/config`. A missing file yields the defaults; a
    /// malformed one is fatal.
    pub fn load(tool_root: &Path) -> Result<Config> {
        let path = tool_root.join("config");
        if !path.exists() {
            return Ok(Config { ini: None });
        }
        match Ini::load_from_file(&path) {
            Ok(ini) => Ok(Config { ini: Some(ini) }),
            Err(e) => Err(ErrorKind::IncorrectConfig(format!(
                "failed to parse config file {}: {}",
                path.display(),
                e
            ))
            .into()),
        }
    }

    /// Value for `section.key`; empty strings count as unset.
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.ini
            .as_ref()
            .and_then(|ini| ini.get_from(Some(section), key))
            .filter(|v| !v.is_empty())
    }

    pub fn cdb_name(&self) -> String {
        self.get(PLATFORM_SECTION, "CDB_NAME")
            .unwrap_or("compile_commands.json")
            .to_string()
    }

    pub fn source_list_file_name(&self) -> String {
        self.get(PLATFORM_SECTION, "SOURCE_FILES")
            .unwrap_or("source_files.json")
            .to_string()
    }

    pub fn preprocess_dir_name(&self) -> String {
        self.get(PLATFORM_SECTION, "PREPROCESS")
            .unwrap_or("preprocess")
            .to_string()
    }

    /// Seed keys for each link target's properties document, from the
    /// `PROPERTY_KEY` section.
    pub fn properties_template(&self) -> Vec<(String, String)> {
        self.ini
            .as_ref()
            .and_then(|ini| ini.section(Some("PROPERTY_KEY")))
            .map(|section| {
                section
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Set `key` in an ordered properties document, replacing an existing value.
pub fn set_property(properties: &mut Vec<(String, String)>, key: &str, value: String) {
    match properties.iter_mut().find(|(k, _)| k == key) {
        Some((_, v)) => *v = value,
        None => properties.push((key.to_string(), value)),
    }
}

/// Render a properties document as `key=value` lines.
pub fn render_properties(properties: &[(String, String)]) -> String {
    let mut ini = Ini::new();
    for (key, value) in properties {
        ini.with_section(None::<String>).set(key.as_str(), value.as_str());
    }
    let mut out = vec![];
    // Writing to a Vec cannot fail.
    let _ = ini.write_to(&mut out);
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::utils::write_file;

    #[test]
    fn test_defaults_without_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.cdb_name(), "compile_commands.json");
        assert_eq!(config.source_list_file_name(), "source_files.json");
        assert_eq!(config.preprocess_dir_name(), "preprocess");
        assert!(config.properties_template().is_empty());
    }

    #[test]
    fn test_config_overrides() {
        let dir = tempfile::TempDir::new().unwrap();
        write_file(
            &dir.path().join("config"),
            "[linux]\n\
             CDB_NAME=cdb.json\n\
             SOURCE_FILES=\n\
             [PROPERTY_KEY]\n\
             dependencies=\n\
             c_scan_options=\n",
        );
        let config = Config::load(dir.path()).unwrap();
        #[cfg(not(windows))]
        assert_eq!(config.cdb_name(), "cdb.json");
        // Empty value falls back to the default.
        assert_eq!(config.source_list_file_name(), "source_files.json");
        let template = config.properties_template();
        assert_eq!(
            template.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
            vec!["dependencies", "c_scan_options"]
        );
    }

    #[test]
    fn test_malformed_config_is_fatal() {
        let dir = tempfile::TempDir::new().unwrap();
        write_file(&dir.path().join("config"), "[unterminated\n");
        let err = Config::load(dir.path()).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::IncorrectConfig(_)));
    }

    #[test]
    fn test_render_properties() {
        let mut properties = vec![("dependencies".to_string(), String::new())];
        set_property(&mut properties, "dependencies", "lib.a libz.a".to_string());
        set_property(&mut properties, "c_scan_options", "-std=gnu99".to_string());
        let text = render_properties(&properties);
        assert!(text.contains("dependencies=lib.a libz.a"));
        assert!(text.contains("c_scan_options=-std=gnu99"));
    }
}
