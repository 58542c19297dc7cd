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

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use log::info;
use serde_json::{json, Value};

use crate::cdb::CdbEntry;
use crate::errors::*;
use crate::profile::tool::ToolProfile;
use crate::profile::{as_array, as_str, required, schema_err, string_list};
use crate::util;

/// An ordered bundle of tool profiles with binary-name routing.
#[derive(Debug, Default)]
pub struct ToolchainProfile {
    /// Owned tool profiles; everything else holds indices into this.
    profiles: Vec<ToolProfile>,
    /// Binary stem to tool profile index.
    binaries: BTreeMap<String, usize>,
    /// Origin tags per tool profile, for toolchain auto-detection.
    origins: HashMap<usize, Vec<String>>,
}

impl ToolchainProfile {
    /// Load `profile.json` from a toolchain profile directory.
    pub fn load_dir(profile_path: &Path) -> Result<ToolchainProfile> {
        info!("Toolchain profile path: {}", profile_path.display());
        let file = profile_path.join("profile.json");
        let text = fs::read_to_string(&file)
            .chain_err(|| ErrorKind::IncorrectProfile(format!("cannot read {}", file.display())))?;
        let json: Value = serde_json::from_str(&text)
            .chain_err(|| ErrorKind::IncorrectProfile(format!("failed to parse {}", file.display())))?;
        ToolchainProfile::load(&json, profile_path)
    }

    /// Load a toolchain profile from JSON; tool profile paths resolve
    /// against `profile_path`.
    pub fn load(json: &Value, profile_path: &Path) -> Result<ToolchainProfile> {
        let mut toolchain = ToolchainProfile::default();

        let tools = as_array(required(json, "tools")?, "tools", false)?;
        info!("Toolchain profile tools: {}", tools.len());

        for tool in tools {
            if !tool.is_object() {
                return schema_err(format!("'tools' entry is not an object: {}", tool));
            }
            let tool_path = Path::new(as_str(required(tool, "profile")?, "profile")?);
            let tool_path = if tool_path.is_absolute() {
                tool_path.to_path_buf()
            } else {
                profile_path.join(tool_path)
            };

            let profile = ToolProfile::load_file(&tool_path)?;
            let index = toolchain.profiles.len();

            // Explicit aliases on the toolchain entry override the tool
            // profile's default ones.
            match tool.get("aliases") {
                Some(aliases) => {
                    for alias in string_list(aliases, "aliases", false)? {
                        toolchain.binaries.insert(alias, index);
                    }
                }
                None => {
                    for alias in profile.default_aliases() {
                        toolchain.binaries.insert(alias.clone(), index);
                    }
                }
            }

            if let Some(origin) = tool.get("origin") {
                toolchain
                    .origins
                    .insert(index, string_list(origin, "origin", false)?);
            }

            toolchain.profiles.push(profile);
        }
        info!("Loaded {} tool profiles", toolchain.profiles.len());

        Ok(toolchain)
    }

    /// Second-stage load of every owned tool profile, after probing.
    pub fn load_actionable(&mut self) {
        for profile in &mut self.profiles {
            profile.load_actionable();
        }
    }

    /// Index of the tool profile responsible for the entry's binary.
    pub fn tool_index(&self, entry: &CdbEntry) -> Option<usize> {
        let binary = entry.arguments.first()?;
        self.binaries.get(&util::binary_stem(binary)).copied()
    }

    pub fn tool_profile(&self, entry: &CdbEntry) -> Option<&ToolProfile> {
        self.tool_index(entry).map(|i| &self.profiles[i])
    }

    pub fn profile_mut(&mut self, index: usize) -> &mut ToolProfile {
        &mut self.profiles[index]
    }

    /// Origin tags of a tool profile, if declared.
    pub fn profile_origins(&self, index: usize) -> Option<&[String]> {
        self.origins.get(&index).map(Vec::as_slice)
    }

    /// Per-binary tracer configs: each traced binary together with the
    /// response file options the tracer must capture.
    pub fn binaries_to_trace(&self) -> BTreeMap<String, Value> {
        self.binaries
            .iter()
            .map(|(binary, &index)| {
                let config = json!({
                    "binary": binary,
                    "responseFileArgs": self.profiles[index].response_file_config(),
                });
                (binary.clone(), config)
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::stringvec;
    use crate::test::utils::write_file;

    fn gcc_tool_json() -> &'static str {
        r#"{
            "aliases": ["gcc", "g++"],
            "defaultCommandKind": "compile",
            "options": [
                {"aliases": ["@"], "argFormat": ["attached"], "type": "response"}
            ]
        }"#
    }

    fn toolchain_dir() -> tempfile::TempDir {
        let dir = tempfile::TempDir::new().unwrap();
        write_file(
            &dir.path().join("profile.json"),
            r#"{
                "tools": [
                    {"aliases": ["cc1", "cc1plus"], "profile": "./gcc.json",
                     "origin": ["linux-gnu"]},
                    {"profile": "./as.json"},
                    {"profile": "./ld.json"}
                ]
            }"#,
        );
        write_file(&dir.path().join("gcc.json"), gcc_tool_json());
        write_file(
            &dir.path().join("as.json"),
            r#"{
                "aliases": ["as"],
                "defaultCommandKind": "assemble",
                "options": [
                    {"aliases": ["@"], "argFormat": ["attached"], "type": "response"}
                ]
            }"#,
        );
        write_file(
            &dir.path().join("ld.json"),
            r#"{
                "aliases": ["ld"],
                "defaultCommandKind": "link",
                "options": [
                    {"aliases": ["@"], "argFormat": ["attached"], "type": "response"}
                ]
            }"#,
        );
        dir
    }

    fn entry(args: Vec<String>) -> CdbEntry {
        CdbEntry {
            directory: "/work".into(),
            arguments: args,
            respfile: None,
        }
    }

    #[test]
    fn test_load_and_lookup() {
        let dir = toolchain_dir();
        let toolchain = ToolchainProfile::load_dir(dir.path()).unwrap();

        // Explicit aliases override the profile's defaults.
        assert!(toolchain.tool_profile(&entry(stringvec!["gcc", "-c"])).is_none());
        assert!(toolchain
            .tool_profile(&entry(stringvec!["/usr/lib/gcc/cc1", "-c"]))
            .is_some());
        assert!(toolchain.tool_profile(&entry(stringvec!["as", "-o"])).is_some());
        assert!(toolchain.tool_profile(&entry(stringvec!["make"])).is_none());
        assert!(toolchain.tool_profile(&entry(vec![])).is_none());
    }

    #[test]
    fn test_origins() {
        let dir = toolchain_dir();
        let toolchain = ToolchainProfile::load_dir(dir.path()).unwrap();
        let index = toolchain
            .tool_index(&entry(stringvec!["cc1", "-c"]))
            .unwrap();
        assert_eq!(
            toolchain.profile_origins(index),
            Some(&["linux-gnu".to_string()][..])
        );
        let as_index = toolchain.tool_index(&entry(stringvec!["as"])).unwrap();
        assert_eq!(toolchain.profile_origins(as_index), None);
    }

    #[test]
    fn test_binaries_to_trace() {
        let dir = toolchain_dir();
        let toolchain = ToolchainProfile::load_dir(dir.path()).unwrap();
        let binaries = toolchain.binaries_to_trace();
        let names: Vec<&String> = binaries.keys().collect();
        assert_eq!(names, vec!["as", "cc1", "cc1plus", "ld"]);
        assert_eq!(
            binaries["cc1"],
            serde_json::json!({
                "binary": "cc1",
                "responseFileArgs": [
                    {"argument": "@", "argFormat": ["attached"]}
                ]
            })
        );
    }

    #[test]
    fn test_load_failures() {
        let dir = toolchain_dir();
        write_file(&dir.path().join("bad-gcc.json"), "{}");
        let fails = vec![
            serde_json::json!({}),
            serde_json::json!({"tools": "a"}),
            serde_json::json!({"tools": []}),
            serde_json::json!({"tools": ["a"]}),
            serde_json::json!({"tools": [{}]}),
            serde_json::json!({"tools": [{"profile": []}]}),
            serde_json::json!({"tools": [{"profile": "./gcc.json", "aliases": "gcc"}]}),
            serde_json::json!({"tools": [{"profile": "./gcc.json", "aliases": [{}]}]}),
            serde_json::json!({"tools": [{"profile": "./bad-gcc.json"}]}),
            serde_json::json!({"tools": [{"profile": "./missing.json"}]}),
        ];
        for fail in fails {
            let res = ToolchainProfile::load(&fail, dir.path());
            assert!(res.is_err(), "should not parse {}", fail);
        }
    }

    #[test]
    fn test_load_dir_missing() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(ToolchainProfile::load_dir(dir.path()).is_err());
    }
}
