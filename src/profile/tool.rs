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

use log::{debug, info, warn};
use serde_json::{json, Value};

use crate::cdb::CdbEntry;
use crate::errors::*;
use crate::profile::option::{OptionEffect, ToolOption};
use crate::profile::parsed::{CommandKind, FileFormat, ParsedWorkItem};
use crate::profile::{as_array, as_object, as_str, as_str_allow_empty, required, schema_err, string_list};
use crate::util;

/// Profile lists that probe actions may prepend to before they are
/// materialized by `load_actionable`.
pub const ACTIONABLE_CONFIGS: &[&str] = &[
    "cPrependPreprocessingOptions",
    "cAppendPreprocessingOptions",
    "cxxPrependPreprocessingOptions",
    "cxxAppendPreprocessingOptions",
    "cPrependScanOptions",
    "cxxPrependScanOptions",
    "cSystemIncludePaths",
    "cPreIncludes",
    "cxxSystemIncludePaths",
    "cxxPreIncludes",
];

const PROBE_TABLES: &[&str] = &["probeCMacros", "probeCxxMacros"];

/// A text rewrite applied to preprocessed output.
#[derive(Debug)]
enum TextSubstitution {
    Literal { pattern: String, replacement: String },
    Regex { pattern: regex::Regex, replacement: String },
}

/// Declarative description of one toolchain tool.
///
/// Loading is two-stage: `load` parses and validates the JSON, keeping it
/// around; `load_actionable` materializes the lists the prober may have
/// mutated in between.
#[derive(Debug, Default)]
pub struct ToolProfile {
    /// The validated profile JSON, mutable by probe actions until
    /// `load_actionable` runs.
    raw: Value,

    /// Directory of the profile file, pre-includes and system include
    /// paths resolve against it.
    profile_dir: PathBuf,

    aliases: BTreeSet<String>,
    /// Aliases that default the source language to C.
    c_aliases: BTreeSet<String>,
    /// Aliases that default the source language to C++.
    cxx_aliases: BTreeSet<String>,

    default_kind: Option<CommandKind>,
    option_prefix: Option<String>,
    options: Vec<ToolOption>,

    // Special options; the last declared of each type wins.
    resp_file_option: Option<usize>,
    preprocess_option: Option<usize>,
    output_option: Option<usize>,
    pre_include_option: Option<usize>,
    sys_inc_path_option: Option<usize>,

    /// Response file option spec handed to the tracers.
    response_file_config: Vec<Value>,

    /// Extension (with leading dot) to format, for source recognition.
    source_extensions: BTreeMap<String, FileFormat>,
    /// Extension (with leading dot) to format, for target recognition.
    target_extensions: BTreeMap<String, FileFormat>,

    substitutions: Vec<TextSubstitution>,

    // Materialized by load_actionable.
    c_prepend_pp_options: Vec<String>,
    cxx_prepend_pp_options: Vec<String>,
    c_append_pp_options: Vec<String>,
    cxx_append_pp_options: Vec<String>,
    c_prepend_scan_options: Vec<String>,
    cxx_prepend_scan_options: Vec<String>,
    c_pre_includes: Vec<String>,
    cxx_pre_includes: Vec<String>,
    c_sys_inc_paths: Vec<String>,
    cxx_sys_inc_paths: Vec<String>,
}

impl ToolProfile {
    /// Load and validate a tool profile from a file.
    pub fn load_file(path: &Path) -> Result<ToolProfile> {
        info!("Tool profile path: {}", path.display());
        let text = fs::read_to_string(path)
            .chain_err(|| ErrorKind::IncorrectProfile(format!("cannot read {}", path.display())))?;
        let json: Value = serde_json::from_str(&text).chain_err(|| {
            ErrorKind::IncorrectProfile(format!("failed to parse {}", path.display()))
        })?;
        let dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        ToolProfile::load(json, &dir)
    }

    /// Stage 1: parse and validate the profile JSON. The JSON is kept so the
    /// prober can mutate actionable lists before `load_actionable`.
    pub fn load(json: Value, profile_dir: &Path) -> Result<ToolProfile> {
        let mut profile = ToolProfile {
            profile_dir: profile_dir.to_path_buf(),
            ..Default::default()
        };

        let fill_string_set = |key: &str, set: &mut BTreeSet<String>| -> Result<()> {
            if let Some(v) = json.get(key) {
                for alias in string_list(v, key, false)? {
                    set.insert(alias);
                }
            }
            Ok(())
        };
        fill_string_set("aliases", &mut profile.aliases)?;
        fill_string_set("cAliases", &mut profile.c_aliases)?;
        fill_string_set("cxxAliases", &mut profile.cxx_aliases)?;

        let kind = as_str(required(&json, "defaultCommandKind")?, "defaultCommandKind")?;
        profile.default_kind = match CommandKind::from_str(kind) {
            Some(kind) => Some(kind),
            None => return schema_err(format!("unknown command kind '{}'", kind)),
        };
        info!("Default command kind: {}", kind);

        if let Some(v) = json.get("optionPrefix") {
            profile.option_prefix = Some(as_str(v, "optionPrefix")?.to_string());
        }

        for op in as_array(required(&json, "options")?, "options", false)? {
            let option = ToolOption::from_json(op, profile.option_prefix.as_deref())?;
            let index = profile.options.len();
            match option.effect {
                OptionEffect::RespFile => {
                    // Advertised to the tracers so they can capture response
                    // files at exec time.
                    for alias in option.aliases() {
                        profile.response_file_config.push(json!({
                            "argument": alias,
                            "argFormat": op.get("argFormat").cloned().unwrap_or(Value::Null),
                        }));
                    }
                    profile.resp_file_option = Some(index);
                }
                OptionEffect::Preprocess => profile.preprocess_option = Some(index),
                OptionEffect::Output => profile.output_option = Some(index),
                OptionEffect::PreInclude => profile.pre_include_option = Some(index),
                OptionEffect::SysIncPath => profile.sys_inc_path_option = Some(index),
                _ => {}
            }
            profile.options.push(option);
        }

        let load_ext = |key: &str, map: &mut BTreeMap<String, FileFormat>| -> Result<()> {
            if let Some(v) = json.get(key) {
                for (format_name, exts) in as_object(v, key)? {
                    let format = match FileFormat::from_str(format_name) {
                        Some(format) => format,
                        None => {
                            return schema_err(format!("unknown file format '{}'", format_name))
                        }
                    };
                    for ext in as_array(exts, format_name, false)? {
                        map.insert(as_str_allow_empty(ext, format_name)?.to_string(), format);
                    }
                }
            }
            Ok(())
        };
        load_ext("sourceExtensions", &mut profile.source_extensions)?;
        load_ext("targetExtensions", &mut profile.target_extensions)?;

        if let Some(v) = json.get("textSubstitutions") {
            for sub in as_array(v, "textSubstitutions", false)? {
                if !sub.is_object() {
                    return schema_err(format!("'textSubstitutions' entry is not an object: {}", sub));
                }
                let replacement =
                    as_str_allow_empty(required(sub, "replacement")?, "replacement")?.to_string();
                if let Some(pattern) = sub.get("regex") {
                    let pattern = as_str(pattern, "regex")?;
                    let pattern = regex::Regex::new(pattern).chain_err(|| {
                        ErrorKind::IncorrectProfile(format!("invalid regex '{}'", pattern))
                    })?;
                    profile.substitutions.push(TextSubstitution::Regex {
                        pattern,
                        replacement,
                    });
                } else if let Some(pattern) = sub.get("string") {
                    profile.substitutions.push(TextSubstitution::Literal {
                        pattern: as_str(pattern, "string")?.to_string(),
                        replacement,
                    });
                } else {
                    return schema_err(format!(
                        "in {}, neither property 'string' nor 'regex' exists",
                        sub
                    ));
                }
            }
        }

        // Validate actionable lists; contents materialize in stage 2.
        for key in ACTIONABLE_CONFIGS {
            if let Some(v) = json.get(*key) {
                string_list(v, key, true)?;
            }
        }

        // Validate probe tables.
        for table in PROBE_TABLES {
            if let Some(v) = json.get(*table) {
                for (macro_name, values) in as_object(v, table)? {
                    for (expected, actions) in as_object(values, macro_name)? {
                        for action in as_array(actions, expected, false)? {
                            if !action.is_object() {
                                return schema_err(format!("action is not an object: {}", action));
                            }
                            let config = as_str(required(action, "config")?, "config")?;
                            if !ACTIONABLE_CONFIGS.contains(&config) || json.get(config).is_none() {
                                return schema_err(format!(
                                    "incorrect config to act on: {}",
                                    action
                                ));
                            }
                            let act = as_str(required(action, "action")?, "action")?;
                            if act != "prepend" {
                                return schema_err(format!(
                                    "incorrect action type '{}': {}",
                                    act, action
                                ));
                            }
                            string_list(required(action, "value")?, "value", false)?;
                        }
                    }
                }
            }
        }

        profile.raw = json;
        Ok(profile)
    }

    /// Apply a probe action to the underlying JSON.
    pub fn apply_action(&mut self, action: &Value) {
        let config = action["config"].as_str().unwrap_or_default();
        let act = action["action"].as_str().unwrap_or_default();
        // The only supported action for now.
        if act == "prepend" {
            if let (Some(orig), Some(values)) =
                (self.raw.get_mut(config), action["value"].as_array())
            {
                if let Some(orig) = orig.as_array_mut() {
                    for (i, v) in values.iter().enumerate() {
                        orig.insert(i, v.clone());
                    }
                }
            }
        }
    }

    /// Stage 2: materialize the action-affected lists. Pre-include files and
    /// system include paths are completed against the profile directory.
    pub fn load_actionable(&mut self) {
        debug!("Actionable parts: {}", self.profile_dir.display());
        let raw = &self.raw;
        let fill_string_vec = |key: &str, vec: &mut Vec<String>| {
            if let Some(items) = raw.get(key).and_then(Value::as_array) {
                vec.extend(items.iter().filter_map(Value::as_str).map(String::from));
            }
        };
        fill_string_vec("cPrependPreprocessingOptions", &mut self.c_prepend_pp_options);
        fill_string_vec("cxxPrependPreprocessingOptions", &mut self.cxx_prepend_pp_options);
        fill_string_vec("cAppendPreprocessingOptions", &mut self.c_append_pp_options);
        fill_string_vec("cxxAppendPreprocessingOptions", &mut self.cxx_append_pp_options);
        fill_string_vec("cPrependScanOptions", &mut self.c_prepend_scan_options);
        fill_string_vec("cxxPrependScanOptions", &mut self.cxx_prepend_scan_options);

        let dir = self.profile_dir.clone();
        let fill_path_vec = |key: &str, vec: &mut Vec<String>| {
            if let Some(items) = raw.get(key).and_then(Value::as_array) {
                vec.extend(
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(|p| util::full_path_str(p, &dir)),
                );
            }
        };
        fill_path_vec("cPreIncludes", &mut self.c_pre_includes);
        fill_path_vec("cSystemIncludePaths", &mut self.c_sys_inc_paths);
        fill_path_vec("cxxPreIncludes", &mut self.cxx_pre_includes);
        fill_path_vec("cxxSystemIncludePaths", &mut self.cxx_sys_inc_paths);
    }

    pub fn default_aliases(&self) -> &BTreeSet<String> {
        &self.aliases
    }

    pub fn response_file_config(&self) -> Value {
        Value::Array(self.response_file_config.clone())
    }

    pub(crate) fn is_c_alias(&self, stem: &str) -> bool {
        self.c_aliases.contains(stem)
    }

    pub(crate) fn is_cxx_alias(&self, stem: &str) -> bool {
        self.cxx_aliases.contains(stem)
    }

    pub(crate) fn c_aliases(&self) -> &BTreeSet<String> {
        &self.c_aliases
    }

    pub(crate) fn cxx_aliases(&self) -> &BTreeSet<String> {
        &self.cxx_aliases
    }

    pub(crate) fn preprocess_option(&self) -> Option<&ToolOption> {
        self.preprocess_option.map(|i| &self.options[i])
    }

    pub(crate) fn output_option(&self) -> Option<&ToolOption> {
        self.output_option.map(|i| &self.options[i])
    }

    /// The macro probe table for the given language, if declared.
    pub fn probe_table(&self, is_cxx: bool) -> Option<&Value> {
        let key = if is_cxx { "probeCxxMacros" } else { "probeCMacros" };
        self.raw.get(key)
    }

    /// Classify one compile-database entry into a parsed work item.
    pub fn parse_work_item(&self, entry: &CdbEntry) -> Result<ParsedWorkItem> {
        let mut parsed = ParsedWorkItem {
            kind: self.default_kind.unwrap_or(CommandKind::Ignore),
            dir: entry.directory.clone(),
            ..Default::default()
        };
        let dir_path = PathBuf::from(&parsed.dir);

        let mut raw_args: Vec<String> =
            entry.arguments.iter().map(|a| unquote(a).to_string()).collect();

        // Unfold the first response file argument in place.
        if let Some(index) = self.resp_file_option {
            let resp_option = &self.options[index];
            let mut args = Vec::with_capacity(raw_args.len());
            let mut i = 0;
            while i < raw_args.len() {
                let mut pos = i;
                if let Some(resp_arg) = resp_option.match_and_get_arg(&raw_args, &mut pos) {
                    let content = match &entry.respfile {
                        // Prefer the body the tracer captured at exec time.
                        Some(body) => body.clone(),
                        None => {
                            let path = util::full_path(&resp_arg, &dir_path);
                            if path.is_file() {
                                let content = fs::read_to_string(&path).unwrap_or_default();
                                info!("Loaded options from response file {}", path.display());
                                content
                            } else {
                                warn!(
                                    "Response file {} is no longer available. Consider making it persist.",
                                    path.display()
                                );
                                String::new()
                            }
                        }
                    };
                    for token in content.split_whitespace() {
                        args.push(unquote(token).to_string());
                    }
                    i = pos;
                    break;
                }
                args.push(raw_args[i].clone());
                i += 1;
            }
            // Move the rest, if any.
            args.extend_from_slice(&raw_args[i.min(raw_args.len())..]);
            raw_args = args;
        }

        if raw_args.is_empty() {
            return Ok(parsed);
        }
        parsed.binary = raw_args[0].clone();

        // A C/C++ binary name decides the default source language.
        let stem = util::binary_stem(&parsed.binary);
        parsed.format = if self.c_aliases.contains(&stem) {
            FileFormat::C
        } else if self.cxx_aliases.contains(&stem) {
            FileFormat::Cxx
        } else {
            FileFormat::ByExtension
        };

        parsed
            .c_scan_options
            .extend(self.c_prepend_scan_options.iter().cloned());
        parsed
            .cxx_scan_options
            .extend(self.cxx_prepend_scan_options.iter().cloned());

        let has_target_exts = !self.target_extensions.is_empty();

        let mut i = 1;
        while i < raw_args.len() {
            let mut matched = false;
            for option in &self.options {
                if option.try_match(&raw_args, &mut i, &mut parsed) {
                    matched = true;
                    break;
                }
            }
            if matched {
                // The option marked this as a command of no interest,
                // e.g. --help.
                if parsed.kind == CommandKind::Ignore {
                    debug!("Parsed kind: matched: {}", parsed.kind.as_str());
                    break;
                }
                continue;
            }

            let token = &raw_args[i];

            // Unknown flag pass-through.
            if let Some(prefix) = &self.option_prefix {
                if token.starts_with(prefix.as_str()) {
                    parsed.pp_options.push(token.clone());
                    i += 1;
                    continue;
                }
            }

            let ext = extension_of(token);
            if has_target_exts
                && parsed.target.is_empty()
                && self.target_extensions.contains_key(&ext)
            {
                // The first target-like file becomes the target; checked
                // before sources for command lines like ar's.
                parsed.target = util::full_path_str(token, &dir_path);
            } else if let Some(format) = self.source_extensions.get(&ext) {
                let format = if parsed.format == FileFormat::ByExtension {
                    *format
                } else {
                    parsed.format
                };
                parsed
                    .sources
                    .push((util::full_path_str(token, &dir_path), format));
            } else if !token.is_empty() {
                parsed.pp_options.push(token.clone());
                warn!("Unknown option '{}' in {}", token, raw_args.join(" "));
            }
            i += 1;
        }

        Ok(parsed)
    }

    /// Build the option list for preprocessing one source to `target`.
    /// Ordering is contractual: language prepends come first so the
    /// compiler sees policy flags before user flags; the preprocess and
    /// output options come last.
    pub fn preprocessing_options(
        &self,
        target: &str,
        format: FileFormat,
        parsed: &ParsedWorkItem,
    ) -> Vec<String> {
        let (prepend, append, isystem, include) = if format == FileFormat::C {
            (
                &self.c_prepend_pp_options,
                &self.c_append_pp_options,
                &self.c_sys_inc_paths,
                &self.c_pre_includes,
            )
        } else {
            (
                &self.cxx_prepend_pp_options,
                &self.cxx_append_pp_options,
                &self.cxx_sys_inc_paths,
                &self.cxx_pre_includes,
            )
        };

        let mut res = vec![];
        res.extend(prepend.iter().cloned());
        if let Some(option) = self.sys_inc_path_option.map(|i| &self.options[i]) {
            for path in isystem {
                res.extend(option.render(path));
            }
        }
        if let Some(option) = self.pre_include_option.map(|i| &self.options[i]) {
            for file in include {
                res.extend(option.render(file));
            }
        }
        res.extend(parsed.pp_options.iter().cloned());
        res.extend(append.iter().cloned());
        if let Some(option) = self.preprocess_option() {
            res.extend(option.render(""));
        }
        if let Some(option) = self.output_option() {
            res.extend(option.render(target));
        }
        res
    }

    /// Apply the profile's text substitutions, in declared order, to a
    /// whole preprocessed output.
    pub fn process_source_code(&self, input: String) -> String {
        let mut text = input;
        for sub in &self.substitutions {
            text = match sub {
                TextSubstitution::Literal { pattern, replacement } => {
                    text.replace(pattern.as_str(), replacement)
                }
                TextSubstitution::Regex { pattern, replacement } => {
                    pattern.replace_all(&text, replacement.as_str()).into_owned()
                }
            };
        }
        text
    }
}

// Sometimes clang etc. generate response files or sub command lines with
// naively quoted options. Remove the quotes before processing.
fn unquote(orig: &str) -> &str {
    if orig.len() >= 2 && orig.starts_with('"') && orig.ends_with('"') {
        &orig[1..orig.len() - 1]
    } else {
        orig
    }
}

/// File extension with the leading dot, as the profile extension tables
/// key it. Empty when the token has none.
fn extension_of(token: &str) -> String {
    Path::new(token)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default()
}
