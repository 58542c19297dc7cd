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

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use log::{info, warn};

use crate::build::{filtered_out, AsResult, BuildShared, CcResult, LdResult, ResultFile};
use crate::cdb::CdbEntry;
use crate::profile::{CommandKind, FileFormat, ParsedWorkItem, ToolProfile, ToolchainProfile};
use crate::util::{self, Digest};

/// Stand-in target for link commands that do not name one.
pub const DEFAULT_OUTPUT_TARGET: &str = "DEFAULT_OUTPUT";

/// Processes a single compile-database entry: classifies it, re-invokes
/// the compiler to preprocess, and hands CC/AS/LD results back to the
/// build processor's queues.
pub struct WorkItemProcessor {
    toolchain: Arc<ToolchainProfile>,
    entry: CdbEntry,
    shared: Arc<BuildShared>,
}

impl WorkItemProcessor {
    pub fn new(
        toolchain: Arc<ToolchainProfile>,
        entry: CdbEntry,
        shared: Arc<BuildShared>,
    ) -> WorkItemProcessor {
        WorkItemProcessor {
            toolchain,
            entry,
            shared,
        }
    }

    pub fn process(&self) {
        if self.entry.directory.is_empty() || self.entry.arguments.is_empty() {
            return;
        }

        let profile = match self.toolchain.tool_profile(&self.entry) {
            Some(profile) => profile,
            None => {
                warn!("Binary not recognized: {:?}", self.entry.arguments);
                return;
            }
        };

        // Filter by the last component of the working directory.
        let lastdir = util::basename(&self.entry.directory);
        if filtered_out(&self.shared.dir_filter, &lastdir) {
            info!("Directory {} filtered", self.entry.directory);
            return;
        }

        let parsed = match profile.parse_work_item(&self.entry) {
            Ok(parsed) => parsed,
            Err(e) => {
                info!("IGNORED: Command {:?}: {}", self.entry.arguments, e);
                return;
            }
        };

        if parsed.kind == CommandKind::Ignore {
            info!("IGNORED: Command {:?}", self.entry.arguments);
            return;
        }

        // All commands need source files.
        if parsed.sources.is_empty() {
            info!("Command has no source\n{}", parsed.to_json());
            return;
        }

        match parsed.kind {
            CommandKind::Compile => {
                let first_source = &parsed.sources[0].0;
                if !self.shared.whitelist_files.is_empty()
                    && !self.shared.whitelist_files.contains(first_source)
                {
                    return;
                }
                if !self.shared.blacklist_files.is_empty()
                    && self.shared.blacklist_files.contains(first_source)
                {
                    return;
                }
                self.handle_compile(profile, parsed);
            }
            CommandKind::Assemble => {
                let mut parsed = parsed;
                let source = parsed.sources.swap_remove(0).0;
                self.shared.push_as(AsResult {
                    target: parsed.target,
                    source,
                });
            }
            CommandKind::Archive | CommandKind::Link => self.handle_link(parsed),
            CommandKind::Ignore => {}
        }
    }

    /// Emit an LD result for a link or archive command.
    fn handle_link(&self, mut parsed: ParsedWorkItem) {
        if parsed.target.is_empty() {
            if parsed.kind == CommandKind::Link {
                parsed.target = DEFAULT_OUTPUT_TARGET.to_string();
            } else {
                warn!("Archive target is empty\n{}", parsed.to_json());
                return;
            }
        }

        let target_name = util::basename(&parsed.target);
        if filtered_out(&self.shared.link_filter, &target_name) {
            info!("Link target {} filtered out", target_name);
            return;
        }

        let sources = parsed.sources.into_iter().map(|(file, _)| file).collect();
        self.shared.push_ld(LdResult {
            target: parsed.target,
            sources,
        });
    }

    /// Preprocess every source of a compile command and emit CC results.
    fn handle_compile(&self, profile: &ToolProfile, mut parsed: ParsedWorkItem) {
        let multi_sources = parsed.sources.len() > 1;
        let mut pseudo_link_sources: Vec<(String, FileFormat)> = vec![];

        // If no target was specified, create a pseudo one.
        if parsed.target.is_empty() {
            parsed.target = util::temp_path(&self.shared.output_dir)
                .to_string_lossy()
                .into_owned();
        }

        let sources = parsed.sources.clone();
        for (file, format) in &sources {
            let file_path = Path::new(file);
            if !file_path.exists() {
                warn!("Source file {} no longer exists, ignored", file);
                continue;
            }

            let mut pp_file_name = util::basename(file);
            let mut temp_path = util::temp_path(&self.shared.output_dir);
            let mut c_scan_options = parsed.c_scan_options.clone();
            let mut cxx_scan_options = parsed.cxx_scan_options.clone();
            match format {
                FileFormat::C => {
                    pp_file_name.push_str(".i");
                    temp_path.set_extension("i");
                    cxx_scan_options.clear();
                }
                FileFormat::Cxx => {
                    pp_file_name.push_str(".ii");
                    temp_path.set_extension("ii");
                    c_scan_options.clear();
                }
                _ => {}
            }

            let temp = temp_path.to_string_lossy().into_owned();
            let opts = profile.preprocessing_options(&temp, *format, &parsed);
            let binary = util::resolve_binary(&parsed.binary, Path::new(&parsed.dir));

            info!(
                "Running: {} {} {} (dir: {}, target: {})",
                binary.display(),
                opts.join(" "),
                file,
                parsed.dir,
                parsed.target
            );

            let ok = match Command::new(&binary)
                .args(&opts)
                .arg(file)
                .current_dir(&parsed.dir)
                .status()
            {
                Ok(status) if status.success() => true,
                Ok(status) => {
                    warn!(
                        "Preprocessing failed with exit code {:?}\n{}",
                        status.code(),
                        parsed.to_json()
                    );
                    false
                }
                Err(e) => {
                    warn!("Failed to run {}, reason: {}", binary.display(), e);
                    false
                }
            };
            if !ok {
                info!("[FAIL]{} || {}", pp_file_name, file);
                let _ = fs::remove_file(&temp_path);
                return;
            }

            let original = match fs::read(&temp_path) {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(e) => {
                    warn!("Cannot read preprocessed output {}: {}", temp, e);
                    let _ = fs::remove_file(&temp_path);
                    return;
                }
            };

            // Collect the non-system headers this TU depends on, from
            // new-file line markers of the form `# 1 "./config.h" 1`.
            let mut deps = BTreeSet::new();
            for line in original.lines() {
                if line.starts_with('#') && line.ends_with('1') {
                    let parts: Vec<&str> = line.split('"').collect();
                    if parts.len() == 3 && !parts[1].starts_with('<') {
                        deps.insert(util::full_path_str(parts[1], Path::new(&parsed.dir)));
                    }
                }
            }

            let replaced = profile.process_source_code(original);

            let mut digest = Digest::new();
            digest.update(replaced.as_bytes());
            let checksum = digest.finish();

            if let Err(e) = fs::write(&temp_path, &replaced) {
                warn!("Cannot write back {}: {}", temp, e);
                let _ = fs::remove_file(&temp_path);
                return;
            }

            let mut target = parsed.target.clone();
            let target_is_directory = Path::new(&target).is_dir();

            if target_is_directory {
                // Place the per-source object under the target directory.
                let stem = file_path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                target = Path::new(&target)
                    .join(format!("{}.o", stem))
                    .to_string_lossy()
                    .into_owned();
            }

            if multi_sources && !target_is_directory {
                // A unique intermediate per source; the pseudo link below
                // associates them back to the command line target.
                target = util::temp_path(&self.shared.output_dir)
                    .to_string_lossy()
                    .into_owned();
                pseudo_link_sources.push((target.clone(), FileFormat::Object));
            }

            self.shared.push_cc(CcResult {
                file: ResultFile {
                    path: temp_path,
                    checksum,
                },
                target,
                source: file.clone(),
                format: *format,
                pp_file_name,
                c_scan_options,
                cxx_scan_options,
                deps,
            });
        }

        // With multiple sources the original target must still map to the
        // per-source intermediates for stitching.
        if multi_sources && !pseudo_link_sources.is_empty() {
            info!(
                "Multiple source files on the compile command line for '{}', creating pseudo link result",
                parsed.target
            );
            let pseudo = ParsedWorkItem {
                kind: CommandKind::Link,
                target: parsed.target.clone(),
                sources: pseudo_link_sources,
                ..Default::default()
            };
            self.handle_link(pseudo);
        }
    }
}
