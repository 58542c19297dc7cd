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

//! Learns compiler-specific macro values by preprocessing a synthesized
//! probe source, so profiles can adopt correct defaults (e.g. the C
//! standard in effect) before the real preprocessing runs.

use std::collections::HashSet;
use std::env;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::Command;

use log::{info, warn};
use serde_json::Value;

use crate::cdb::CdbEntry;
use crate::profile::{ToolProfile, ToolchainProfile};
use crate::util;

/// Sentinel prefixed to each monitored macro in the probe source. After
/// preprocessing the macro is replaced by its definition while the
/// sentinel copy is left alone.
pub const PROBE_PREFIX: &str = "__XCAL__";

/// Probe every distinct tool referenced by the trace, applying matched
/// probe rules onto the tool profiles. Must run before `load_actionable`
/// so the mutations flow into the materialized lists. Best-effort: a
/// failing probe leaves its profile unmodified.
pub fn probe_toolchain(cdb: &[CdbEntry], toolchain: &mut ToolchainProfile) {
    let mut probed = HashSet::new();

    info!("Compile database size: {}", cdb.len());

    for entry in cdb {
        if entry.directory.is_empty() {
            info!("No directory, skipped");
            continue;
        }
        if entry.arguments.is_empty() {
            info!("Empty arguments, skipped");
            continue;
        }

        let index = match toolchain.tool_index(entry) {
            Some(index) => index,
            None => {
                info!("Unknown profile, skipped");
                continue;
            }
        };
        if !probed.insert(index) {
            continue;
        }

        let profile = toolchain.profile_mut(index);
        // A tool we cannot drive in preprocess-to-file mode cannot be probed.
        if profile.output_option().is_none() || profile.preprocess_option().is_none() {
            continue;
        }

        let binary_path = util::resolve_binary(&entry.arguments[0], Path::new(&entry.directory));
        if profile.probe_table(true).is_some() {
            probe_macros(&binary_path, profile, true);
        }
        if profile.probe_table(false).is_some() {
            probe_macros(&binary_path, profile, false);
        }
    }
}

/// Probe one language of one tool and apply the matched rules.
pub fn probe_macros(binary_path: &Path, profile: &mut ToolProfile, is_cxx: bool) {
    let mut binary = binary_path.to_path_buf();

    // If probing C/C++ but the observed binary is an alias for the other
    // language, switch to a same-directory alias with the right role when
    // one exists on disk.
    let stem = util::binary_stem(&binary.to_string_lossy());
    let wrong_role = if is_cxx {
        profile.is_c_alias(&stem)
    } else {
        profile.is_cxx_alias(&stem)
    };
    if wrong_role {
        let (filter, needed) = if is_cxx {
            (profile.c_aliases(), profile.cxx_aliases())
        } else {
            (profile.cxx_aliases(), profile.c_aliases())
        };
        let has_needed = !needed.is_empty();
        let candidates: Vec<&String> = if has_needed {
            needed.iter().collect()
        } else {
            // Only generic names; find one that is not the wrong role.
            profile
                .default_aliases()
                .iter()
                .filter(|a| !filter.contains(*a))
                .collect()
        };
        let parent = binary.parent().unwrap_or_else(|| Path::new("")).to_path_buf();
        for alias in candidates {
            let mut alias_path = parent.join(alias);
            if let Some(ext) = binary.extension() {
                alias_path.set_extension(ext);
            }
            if alias_path.exists() {
                binary = alias_path;
                break;
            }
        }
    }

    let temp_dir = env::temp_dir();
    let input_path = util::temp_path(&temp_dir).with_extension(if is_cxx { "cc" } else { "c" });
    let output_path = util::temp_path(&temp_dir);

    let macros = match profile.probe_table(is_cxx) {
        Some(macros) => macros.clone(),
        None => return,
    };

    if let Err(e) = write_probe_source(&input_path, &macros) {
        warn!("Failed to write probe input {}: {}", input_path.display(), e);
        let _ = fs::remove_file(&input_path);
        return;
    }

    info!(
        "Probing {} compiler '{}'",
        if is_cxx { "C++" } else { "C" },
        binary.display()
    );

    let mut args = vec![];
    if let Some(option) = profile.output_option() {
        args.extend(option.render(&output_path.to_string_lossy()));
    }
    if let Some(option) = profile.preprocess_option() {
        args.extend(option.render(""));
    }

    let ok = match Command::new(&binary).args(&args).arg(&input_path).status() {
        Ok(status) if status.success() => true,
        Ok(status) => {
            warn!(
                "Failed to run {}, exit code: {:?}",
                binary.display(),
                status.code()
            );
            false
        }
        Err(e) => {
            warn!("Failed to run {}, reason: {}", binary.display(), e);
            false
        }
    };

    if ok {
        // Parse output and apply actions.
        for actions in parse_macro_expansions(&output_path, &macros) {
            if let Some(actions) = actions.as_array() {
                for action in actions {
                    profile.apply_action(action);
                }
            }
        }
    }

    let _ = fs::remove_file(&input_path);
    let _ = fs::remove_file(&output_path);
}

/// Write the probe input: one `__XCAL__M M` line per monitored macro.
pub fn write_probe_source(path: &Path, macros: &Value) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    if let Some(table) = macros.as_object() {
        for name in table.keys() {
            writeln!(file, "{}{} {}", PROBE_PREFIX, name, name)?;
        }
    }
    Ok(())
}

/// Parse the preprocessed probe output: for every sentinel line whose
/// expansion matches a configured expected value, collect that rule's
/// action list.
pub fn parse_macro_expansions(path: &Path, macros: &Value) -> Vec<Value> {
    let mut res = vec![];
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(_) => return res,
    };
    let table = match macros.as_object() {
        Some(table) => table,
        None => return res,
    };
    for line in content.lines() {
        let rest = match line.strip_prefix(PROBE_PREFIX) {
            Some(rest) => rest,
            None => continue,
        };
        for (name, values) in table {
            if let Some(tail) = rest.strip_prefix(name.as_str()) {
                if let Some(value) = tail.strip_prefix(' ') {
                    info!("Macro '{}' expands to '{}'", name, value);
                    if let Some(actions) = values.get(value) {
                        info!("Apply actions for macro '{}'", name);
                        res.push(actions.clone());
                    }
                }
            }
        }
    }
    res
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn probe_table() -> Value {
        json!({
            "__STDC_VERSION__": {
                "199901L": [
                    {"config": "cPrependScanOptions", "action": "prepend",
                     "value": ["-std=gnu99"]}
                ],
                "201112L": [
                    {"config": "cPrependScanOptions", "action": "prepend",
                     "value": ["-std=gnu11"]}
                ]
            },
            "__GNUC__": {
                "4": []
            }
        })
    }

    #[test]
    fn test_write_probe_source() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("probe.c");
        write_probe_source(&path, &probe_table()).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("__XCAL____GNUC__ __GNUC__\n"));
        assert!(content.contains("__XCAL____STDC_VERSION__ __STDC_VERSION__\n"));
    }

    #[test]
    fn test_parse_macro_expansions() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("probe.out");
        std::fs::write(
            &path,
            "# 1 \"probe.c\"\n\
             __XCAL____STDC_VERSION__ 199901L\n\
             __XCAL____GNUC__ 7\n\
             unrelated line\n",
        )
        .unwrap();
        let actions = parse_macro_expansions(&path, &probe_table());
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0][0]["value"][0], "-std=gnu99");
    }

    #[test]
    fn test_parse_macro_expansions_unmatched_value() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("probe.out");
        std::fs::write(&path, "__XCAL____STDC_VERSION__ 199409L\n").unwrap();
        assert!(parse_macro_expansions(&path, &probe_table()).is_empty());
    }

    #[test]
    fn test_parse_macro_expansions_missing_file() {
        assert!(parse_macro_expansions(Path::new("/nonexistent/probe.out"), &probe_table())
            .is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_probe_applies_actions() {
        use crate::cdb::CdbEntry;
        use crate::stringvec;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();

        // A stand-in compiler: "preprocesses" by expanding __STDC_VERSION__.
        let cc = dir.path().join("fakecc");
        std::fs::write(
            &cc,
            "#!/bin/sh\n\
             out=\nin=\n\
             while [ $# -gt 0 ]; do\n\
               case \"$1\" in\n\
                 -o) out=\"$2\"; shift;;\n\
                 -E) ;;\n\
                 *) in=\"$1\";;\n\
               esac\n\
               shift\n\
             done\n\
             sed 's/ __STDC_VERSION__$/ 199901L/' \"$in\" > \"$out\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&cc, std::fs::Permissions::from_mode(0o755)).unwrap();

        crate::test::utils::write_file(
            &dir.path().join("profile.json"),
            r#"{"tools": [{"profile": "./fakecc.json"}]}"#,
        );
        crate::test::utils::write_file(
            &dir.path().join("fakecc.json"),
            r#"{
                "aliases": ["fakecc"],
                "cAliases": ["fakecc"],
                "defaultCommandKind": "compile",
                "optionPrefix": "-",
                "options": [
                    {"aliases": ["-E"], "type": "preprocess"},
                    {"aliases": ["-o"], "argFormat": ["space"], "type": "output"}
                ],
                "sourceExtensions": {"c": [".c"]},
                "cPrependScanOptions": [],
                "probeCMacros": {
                    "__STDC_VERSION__": {
                        "199901L": [
                            {"config": "cPrependScanOptions", "action": "prepend",
                             "value": ["-std=gnu99"]}
                        ]
                    }
                }
            }"#,
        );

        let mut toolchain = ToolchainProfile::load_dir(dir.path()).unwrap();
        let cdb = vec![CdbEntry {
            directory: dir.path().to_string_lossy().into_owned(),
            arguments: stringvec![cc.to_string_lossy(), "-c", "a.c"],
            respfile: None,
        }];
        probe_toolchain(&cdb, &mut toolchain);
        toolchain.load_actionable();

        let profile = toolchain.tool_profile(&cdb[0]).unwrap();
        let parsed = profile
            .parse_work_item(&CdbEntry {
                directory: dir.path().to_string_lossy().into_owned(),
                arguments: stringvec!["fakecc", "a.c"],
                respfile: None,
            })
            .unwrap();
        assert_eq!(parsed.c_scan_options, stringvec!["-std=gnu99"]);
    }
}
