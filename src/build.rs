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

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use futures::future::{self, Future};
use futures_cpupool::CpuPool;
use log::{debug, info, warn};

use crate::archive::Archive;
use crate::cdb::{self, CdbEntry};
use crate::cmdline::Options;
use crate::config::{self, Config, PROPERTIES_FILE_NAME};
use crate::errors::*;
use crate::prober;
use crate::processor::WorkItemProcessor;
use crate::profile::{FileFormat, ToolchainProfile};
use crate::util::{self, Digest};

/// Synthetic link target collecting compiles whose real link was driven
/// through the compiler. Provisional name kept for scanner compatibility.
pub const TEST_LD_TARGET: &str = "test_ld";

/// A preprocessed output file and its digest.
#[derive(Debug, Clone)]
pub struct ResultFile {
    pub path: PathBuf,
    pub checksum: String,
}

/// Outcome of preprocessing one translation unit.
#[derive(Debug, Clone)]
pub struct CcResult {
    /// The preprocessed output.
    pub file: ResultFile,
    /// The target of the compile command, a .o file.
    pub target: String,
    /// The source file full path.
    pub source: String,
    pub format: FileFormat,
    /// File name the preprocessed output takes inside the archive.
    pub pp_file_name: String,
    pub c_scan_options: Vec<String>,
    pub cxx_scan_options: Vec<String>,
    /// Non-system dependencies mentioned in the preprocessor output.
    pub deps: BTreeSet<String>,
}

/// One assembler invocation: target .o and source .s.
#[derive(Debug, Clone)]
pub struct AsResult {
    pub target: String,
    pub source: String,
}

/// One link or archive invocation: target and inputs in declared order.
#[derive(Debug, Clone)]
pub struct LdResult {
    pub target: String,
    pub sources: Vec<String>,
}

/// State shared between the build processor and its workers. The three
/// result vectors are the only concurrent mutation points; each mutex is
/// held for a single push only.
pub struct BuildShared {
    pub output_dir: PathBuf,
    /// Directory-name filter; a leading "black" token makes it a blacklist.
    pub dir_filter: Vec<String>,
    /// Link-target filter, same convention.
    pub link_filter: Vec<String>,
    pub whitelist_files: Vec<String>,
    pub blacklist_files: Vec<String>,
    cc_results: Mutex<Vec<CcResult>>,
    as_results: Mutex<Vec<AsResult>>,
    ld_results: Mutex<Vec<LdResult>>,
}

impl BuildShared {
    pub fn new(
        output_dir: PathBuf,
        dir_filter: Vec<String>,
        link_filter: Vec<String>,
        whitelist_files: Vec<String>,
        blacklist_files: Vec<String>,
    ) -> BuildShared {
        BuildShared {
            output_dir,
            dir_filter,
            link_filter,
            whitelist_files,
            blacklist_files,
            cc_results: Mutex::new(vec![]),
            as_results: Mutex::new(vec![]),
            ld_results: Mutex::new(vec![]),
        }
    }

    pub fn push_cc(&self, result: CcResult) {
        lock(&self.cc_results).push(result);
    }

    pub fn push_as(&self, result: AsResult) {
        lock(&self.as_results).push(result);
    }

    pub fn push_ld(&self, result: LdResult) {
        lock(&self.ld_results).push(result);
    }

    pub fn take_cc_results(&self) -> Vec<CcResult> {
        std::mem::take(&mut *lock(&self.cc_results))
    }

    pub fn take_as_results(&self) -> Vec<AsResult> {
        std::mem::take(&mut *lock(&self.as_results))
    }

    pub fn take_ld_results(&self) -> Vec<LdResult> {
        std::mem::take(&mut *lock(&self.ld_results))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// First-token-"black" filter convention: a list starting with "black" is
/// a blacklist, anything else is a whitelist. Empty lists pass everything.
pub(crate) fn filtered_out(list: &[String], name: &str) -> bool {
    if list.is_empty() {
        return false;
    }
    let blacklist = list.first().map(|s| s == "black").unwrap_or(false);
    let found = list.iter().any(|k| k == name);
    (blacklist && found) || (!blacklist && !found)
}

/// Tally origin tags across every entry's tool profile and pick the origin
/// matching all entries, or the one with the most matches.
pub(crate) fn detect_toolchain_profile(cdb: &[CdbEntry], toolchain: &ToolchainProfile) -> String {
    let mut origin_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut count = 0;

    for entry in cdb {
        if let Some(index) = toolchain.tool_index(entry) {
            if let Some(origins) = toolchain.profile_origins(index) {
                for origin in origins {
                    *origin_counts.entry(origin.clone()).or_insert(0) += 1;
                }
            }
        }
        count += 1;
    }

    let mut res = String::new();
    let mut highest = 0;
    for (origin, n) in &origin_counts {
        if *n == count {
            // All traced binaries are from a single profile.
            info!("To use fully matched toolchain profile: {}", origin);
            return origin.clone();
        } else if *n > highest {
            res = origin.clone();
            highest = *n;
        }
    }

    info!(
        "To use the best partially matched ({}/{}) toolchain profile: {}",
        highest, count, res
    );
    res
}

/// Per-link-target assembly state.
struct LdInfo {
    /// Archive directory of this target, `<short-name>.dir/<preprocess-dir>`.
    pp_output_path: PathBuf,
    /// Link inputs in declared order; inputs provided by compiles in this
    /// run are removed, leaving the external dependencies.
    dependencies: Vec<String>,
    c_scan_options: Vec<String>,
    c_scan_options_set: bool,
    cxx_scan_options: Vec<String>,
    cxx_scan_options_set: bool,
}

impl LdInfo {
    fn new(pp_output_path: PathBuf) -> LdInfo {
        LdInfo {
            pp_output_path,
            dependencies: vec![],
            c_scan_options: vec![],
            c_scan_options_set: false,
            cxx_scan_options: vec![],
            cxx_scan_options_set: false,
        }
    }
}

/// Drives the whole capture: loads the compile database, probes the
/// toolchain, fans work items out over a worker pool and stitches the
/// results into the output archive.
pub struct BuildProcessor {
    toolchain: ToolchainProfile,
    options: Options,
    output_path: PathBuf,
    cdb_name: String,
    source_list_name: String,
    pp_dir_name: String,
    properties_template: Vec<(String, String)>,
    cdb: Vec<CdbEntry>,
}

impl BuildProcessor {
    pub fn new(toolchain: ToolchainProfile, options: Options, config: &Config) -> BuildProcessor {
        let output_path = fs::canonicalize(&options.output_dir)
            .unwrap_or_else(|_| options.output_dir.clone());
        BuildProcessor {
            toolchain,
            options,
            output_path,
            cdb_name: config.cdb_name(),
            source_list_name: config.source_list_file_name(),
            pp_dir_name: config.preprocess_dir_name(),
            properties_template: config.properties_template(),
            cdb: vec![],
        }
    }

    /// Run a whitelist/blacklist filter command in the build directory and
    /// collect one source path per output line.
    fn run_filter_command(&self, command: &str, file_name: &str) -> Result<Vec<String>> {
        if command.is_empty() {
            return Ok(vec![]);
        }
        let list_file = self.output_path.join(file_name);
        info!("Filter file path: {}", list_file.display());
        let status = Command::new("sh")
            .arg("-c")
            .arg(format!("{} > {}", command, list_file.display()))
            .current_dir(&self.options.build_dir)
            .status();
        if let Err(e) = status {
            warn!("Failed to run filter command {}, reason: {}", command, e);
            return Err(ErrorKind::CdbParse.into());
        }

        let build_dir = self.options.build_dir.clone();
        let mut files = vec![];
        if let Ok(content) = fs::read_to_string(&list_file) {
            for line in content.lines() {
                if !line.is_empty() {
                    files.push(util::full_path_str(line, &build_dir));
                }
            }
        }
        Ok(files)
    }

    pub fn process(mut self) -> Result<()> {
        let cdb_path = self.output_path.join(&self.cdb_name);
        info!("Compile database path: {}", cdb_path.display());

        let whitelist_files = self.run_filter_command(&self.options.wlfcmd, "whitelist.txt")?;
        let blacklist_files = if whitelist_files.is_empty() {
            self.run_filter_command(&self.options.blfcmd, "blacklist.txt")?
        } else {
            vec![]
        };

        self.cdb = cdb::load(&cdb_path)?;

        // Swap in the detected toolchain profile if asked to.
        let mut toolchain = std::mem::take(&mut self.toolchain);
        if self.options.auto_detect {
            let name = detect_toolchain_profile(&self.cdb, &toolchain);
            let path = self.options.tool_root.join("profiles").join(&name);
            toolchain = ToolchainProfile::load_dir(&path)?;
        }

        info!("Probe the toolchain, update profile");
        prober::probe_toolchain(&self.cdb, &mut toolchain);

        info!("Load the actionable parts of the profile");
        toolchain.load_actionable();

        info!("Process work items");
        let toolchain = Arc::new(toolchain);
        let shared = Arc::new(BuildShared::new(
            self.output_path.clone(),
            split_filter(&self.options.fkey),
            split_filter(&self.options.lkey),
            whitelist_files,
            blacklist_files,
        ));
        let pool = CpuPool::new(self.options.parallelism.max(1));
        let jobs: Vec<_> = self
            .cdb
            .iter()
            .cloned()
            .map(|entry| {
                let toolchain = toolchain.clone();
                let shared = shared.clone();
                pool.spawn_fn(move || {
                    WorkItemProcessor::new(toolchain, entry, shared).process();
                    future::ok::<(), ()>(())
                })
            })
            .collect();
        let _ = future::join_all(jobs).wait();

        self.generate_output(&shared)
    }

    /// Stitch results into the archive, checksum manifest, properties
    /// files and source list. Order-independent with regard to worker
    /// scheduling: results are sorted before naming decisions.
    fn generate_output(&self, shared: &BuildShared) -> Result<()> {
        let pp_path = PathBuf::from(&self.pp_dir_name);
        let pp_output_path = self.output_path.join(&pp_path);
        let property_file = PathBuf::from(PROPERTIES_FILE_NAME);

        let mut archive = Archive::create(&pp_output_path)?;

        // Top-level properties file, empty body.
        archive.add_file(&property_file, b"")?;

        let mut checksum_file = String::new();

        let as_results = shared.take_as_results();
        let mut ld_results = shared.take_ld_results();
        let mut cc_results = shared.take_cc_results();

        // Workers finish in nondeterministic order; pin the naming and
        // first-wins decisions to a stable order.
        ld_results.sort_by(|a, b| a.target.cmp(&b.target));
        cc_results.sort_by(|a, b| (&a.source, &a.target).cmp(&(&b.source, &b.target)));

        // Assembler target .o to the .s that produced it, used to link a
        // link input back to the compile that fed the assembler.
        let as_target_to_source: BTreeMap<String, String> = as_results
            .into_iter()
            .map(|r| (r.target, r.source))
            .collect();

        let mut ld_infos: Vec<LdInfo> = vec![];
        // Rewritten link input to the infos consuming it.
        let mut link_targets: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        // Seen short names to their duplication count.
        let mut seen_target_filenames: BTreeMap<String, u32> = BTreeMap::new();
        // Link-target path to the deduplicated short name.
        let mut dependency_names: BTreeMap<String, String> = BTreeMap::new();

        for ld in &ld_results {
            let index = ld_infos.len();

            let mut filename = util::basename(&ld.target);
            match seen_target_filenames.get_mut(&filename) {
                None => {
                    seen_target_filenames.insert(filename.clone(), 1);
                }
                Some(count) => {
                    // Duplicated short name; the first occurrence keeps the
                    // bare name.
                    let suffixed = format!("{}.{}", filename, count);
                    *count += 1;
                    filename = suffixed;
                }
            }

            dependency_names.insert(ld.target.clone(), filename.clone());

            // Archive directory of this target, e.g. a.out.dir/preprocess.
            let info_path = PathBuf::from(format!("{}.dir", filename)).join(&pp_path);
            archive.add_dir(&info_path)?;
            let mut info = LdInfo::new(info_path);

            for source in &ld.sources {
                // A link input that is an assembler target stands for the
                // upstream compile target.
                let actual = as_target_to_source
                    .get(source)
                    .cloned()
                    .unwrap_or_else(|| source.clone());

                // All inputs start as dependencies; those provided by
                // compiles in this run are removed later.
                if !info.dependencies.contains(&actual) {
                    info.dependencies.push(actual.clone());
                }

                let consumers = link_targets.entry(actual).or_insert_with(Vec::new);
                if !consumers.contains(&index) {
                    consumers.push(index);
                }
            }

            ld_infos.push(info);
        }

        if self.options.process_link_using_compiler {
            let index = ld_infos.len();
            let mut filename = TEST_LD_TARGET.to_string();
            match seen_target_filenames.get_mut(&filename) {
                None => {
                    seen_target_filenames.insert(filename.clone(), 1);
                }
                Some(count) => {
                    let suffixed = format!("{}.{}", filename, count);
                    *count += 1;
                    filename = suffixed;
                }
            }
            dependency_names.insert(TEST_LD_TARGET.to_string(), filename.clone());
            let info_path = PathBuf::from(format!("{}.dir", filename)).join(&pp_path);
            archive.add_dir(&info_path)?;
            ld_infos.push(LdInfo::new(info_path));
            link_targets.insert(TEST_LD_TARGET.to_string(), vec![index]);
        }

        // Sources can appear many times across compiles; deduplicate.
        let mut source_files: BTreeSet<String> = BTreeSet::new();
        // Paths already used inside the archive.
        let mut pp_files: BTreeSet<PathBuf> = BTreeSet::new();

        for cc in &cc_results {
            let target_name = if link_targets.contains_key(&cc.target) {
                cc.target.clone()
            } else if self.options.process_link_using_compiler {
                warn!(
                    "Compile target linked through use of compiler command, use {} instead: {}",
                    TEST_LD_TARGET, cc.target
                );
                TEST_LD_TARGET.to_string()
            } else {
                warn!("Compile target not linked: {}", cc.target);
                let _ = fs::remove_file(&cc.file.path);
                continue;
            };

            source_files.insert(cc.source.clone());
            source_files.extend(cc.deps.iter().cloned());

            for &index in &link_targets[&target_name] {
                let info = &mut ld_infos[index];
                let mut path = info.pp_output_path.join(&cc.pp_file_name);

                if !pp_files.insert(path.clone()) {
                    // Suffix the stem until unique within the archive.
                    let orig = path.clone();
                    let mut suffix = 1;
                    loop {
                        path = suffixed_file_name(&orig, suffix);
                        suffix += 1;
                        if pp_files.insert(path.clone()) {
                            break;
                        }
                    }
                }

                archive.add_file_from(&path, &cc.file.path)?;
                info!("[SUCCESS]{} || {}", path.display(), cc.source);

                checksum_file.push_str(&format!(
                    "{} {}\n",
                    cc.file.checksum,
                    pp_output_path.join(&path).display()
                ));

                // The compile provides this input, it is not an external
                // dependency.
                info.dependencies.retain(|dep| dep != &cc.target);

                if cc.format == FileFormat::C && !info.c_scan_options_set {
                    info.c_scan_options = cc.c_scan_options.clone();
                    info.c_scan_options_set = true;
                } else if cc.format == FileFormat::Cxx && !info.cxx_scan_options_set {
                    info.cxx_scan_options = cc.cxx_scan_options.clone();
                    info.cxx_scan_options_set = true;
                }
            }

            // The temporary has been copied into the archive, possibly
            // several times; it is no longer needed.
            if let Err(e) = fs::remove_file(&cc.file.path) {
                debug!("Cannot remove {}: {}", cc.file.path.display(), e);
            }
        }

        // Per-target properties files.
        for info in &ld_infos {
            let mut properties = self.properties_template.clone();

            // External dependencies go by short name when known.
            let dependencies: Vec<String> = info
                .dependencies
                .iter()
                .map(|dep| {
                    dependency_names
                        .get(dep)
                        .cloned()
                        .unwrap_or_else(|| dep.clone())
                })
                .collect();
            config::set_property(&mut properties, "dependencies", dependencies.join(" "));
            config::set_property(
                &mut properties,
                "c_scan_options",
                info.c_scan_options.join(" "),
            );
            config::set_property(
                &mut properties,
                "cxx_scan_options",
                info.cxx_scan_options.join(" "),
            );

            let body = config::render_properties(&properties);
            let path = info
                .pp_output_path
                .parent()
                .unwrap_or_else(|| Path::new(""))
                .join(&property_file);
            archive.add_file(&path, body.as_bytes())?;

            let mut digest = Digest::new();
            digest.update(body.as_bytes());
            checksum_file.push_str(&format!(
                "{} {}\n",
                digest.finish(),
                pp_output_path.join(&path).display()
            ));
        }

        archive.add_file(Path::new("checksum.sha1"), checksum_file.as_bytes())?;
        archive.finish()?;

        let sources: Vec<&String> = source_files.iter().collect();
        let mut body = serde_json::to_string(&sources)?;
        body.push('\n');
        fs::write(self.output_path.join(&self.source_list_name), body)?;

        Ok(())
    }
}

fn split_filter(keyword: &str) -> Vec<String> {
    if keyword.is_empty() {
        vec![]
    } else {
        keyword.split(';').map(String::from).collect()
    }
}

/// `a.c.i` with suffix 1 becomes `a.c.1.i`.
fn suffixed_file_name(path: &Path, suffix: u32) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    path.with_file_name(format!("{}.{}{}", stem, suffix, ext))
}
