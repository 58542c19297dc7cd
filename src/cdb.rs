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

use std::fs;
use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};

use crate::errors::*;

/// One traced tool invocation. Entries missing a directory or arguments are
/// kept on load and skipped by the classifier.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct CdbEntry {
    /// Working directory of the invocation.
    #[serde(default)]
    pub directory: String,
    /// Full argv, including the binary.
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Response file body captured by the tracer at exec time, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub respfile: Option<String>,
}

/// Load the compile database produced by the tracer.
pub fn load(path: &Path) -> Result<Vec<CdbEntry>> {
    let text = fs::read_to_string(path).chain_err(|| ErrorKind::CdbParse)?;
    let entries: Vec<CdbEntry> = match serde_json::from_str(&text) {
        Ok(entries) => entries,
        Err(e) => {
            log::error!("Error parsing compile commands: {}", e);
            return Err(ErrorKind::CdbParse.into());
        }
    };
    info!("Number of compile commands: {}", entries.len());
    Ok(entries)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    fn write_cdb(dir: &tempfile::TempDir, body: &str) -> std::path::PathBuf {
        let path = dir.path().join("compile_commands.json");
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_bad_cdb() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_cdb(&dir, "[-]");
        let err = load(&path).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::CdbParse));
    }

    #[test]
    fn test_load_missing_cdb() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = load(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::CdbParse));
    }

    #[test]
    fn test_load_entries() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_cdb(
            &dir,
            r#"[
                {"directory": "/work", "arguments": ["gcc", "-c", "a.c"]},
                {"directory": "/work", "arguments": ["gcc", "@rsp"], "respfile": "-c -g\n -m"},
                {"arguments": ["ld"]}
            ]"#,
        );
        let entries = load(&path).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].directory, "/work");
        assert_eq!(entries[0].arguments, vec!["gcc", "-c", "a.c"]);
        assert_eq!(entries[1].respfile.as_deref(), Some("-c -g\n -m"));
        assert_eq!(entries[2].directory, "");
    }

    #[test]
    fn test_round_trip() {
        let entry = CdbEntry {
            directory: "/work".into(),
            arguments: vec!["gcc".into(), "-c".into(), "a.c".into()],
            respfile: None,
        };
        let json = serde_json::to_string(&vec![entry.clone()]).unwrap();
        assert!(!json.contains("respfile"));
        let back: Vec<CdbEntry> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, vec![entry]);
    }
}
