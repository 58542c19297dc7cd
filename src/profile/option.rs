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

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::Value;

use crate::errors::*;
use crate::profile::parsed::{CommandKind, FileFormat, ParsedWorkItem};
use crate::profile::{as_array, as_object, as_str, required, schema_err, string_list};
use crate::util;

/// How an option carries its argument on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgFormat {
    /// `-Ipath`
    Attached,
    /// `-I path`
    Space,
    /// `-I=path`
    Equal,
}

impl ArgFormat {
    pub fn from_str(s: &str) -> Option<ArgFormat> {
        match s {
            "attached" => Some(ArgFormat::Attached),
            "space" => Some(ArgFormat::Space),
            "equal" => Some(ArgFormat::Equal),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match *self {
            ArgFormat::Attached => "attached",
            ArgFormat::Space => "space",
            ArgFormat::Equal => "equal",
        }
    }
}

/// Per-language rewrite of an option forwarded to the scanner.
#[derive(Debug, Clone, Default)]
pub struct ScanSpec {
    /// Scan option to emit for C sources, canonical alias when unset.
    c_option: Option<String>,
    /// Scan option to emit for C++ sources, canonical alias when unset.
    cxx_option: Option<String>,
    /// How the rewritten option carries its argument.
    arg_format: Option<ArgFormat>,
    /// Argument rewrites for C.
    c_values: BTreeMap<String, String>,
    /// Argument rewrites for C++.
    cxx_values: BTreeMap<String, String>,
}

impl ScanSpec {
    fn from_json(op: &Value) -> Result<ScanSpec> {
        let mut spec = ScanSpec::default();
        let fill_map = |key: &str, map: &mut BTreeMap<String, String>| -> Result<()> {
            if let Some(values) = op.get(key) {
                for (k, v) in as_object(values, key)? {
                    if k.is_empty() {
                        return schema_err(format!("keys should not be empty strings in {}", values));
                    }
                    map.insert(k.clone(), as_str(v, key)?.to_string());
                }
            }
            Ok(())
        };
        fill_map("cArgValues", &mut spec.c_values)?;
        fill_map("cxxArgValues", &mut spec.cxx_values)?;

        if let Some(v) = op.get("cScanOption") {
            spec.c_option = Some(as_str(v, "cScanOption")?.to_string());
        }
        if let Some(v) = op.get("cxxScanOption") {
            spec.cxx_option = Some(as_str(v, "cxxScanOption")?.to_string());
        }
        if let Some(v) = op.get("scanArgFormat") {
            let s = as_str(v, "scanArgFormat")?;
            match ArgFormat::from_str(s) {
                Some(f) => spec.arg_format = Some(f),
                None => return schema_err(format!("unknown scanArgFormat '{}'", s)),
            }
        }
        Ok(spec)
    }

    fn apply(&self, arg: &str, canonical: &str, parsed: &mut ParsedWorkItem) {
        let c_option = self.c_option.as_deref().unwrap_or(canonical);
        let cxx_option = self.cxx_option.as_deref().unwrap_or(canonical);

        let format = match self.arg_format {
            // No arg expected, just forward the option.
            None => {
                parsed.c_scan_options.push(c_option.to_string());
                parsed.cxx_scan_options.push(cxx_option.to_string());
                return;
            }
            Some(format) => format,
        };

        let add = |values: &BTreeMap<String, String>, option: &str, out: &mut Vec<String>| {
            // Unmapped arg values are forwarded as-is.
            let scan_arg = values.get(arg).map(String::as_str).unwrap_or(arg);
            match format {
                ArgFormat::Space => {
                    out.push(option.to_string());
                    out.push(scan_arg.to_string());
                }
                ArgFormat::Attached => out.push(format!("{}{}", option, scan_arg)),
                ArgFormat::Equal => out.push(format!("{}={}", option, scan_arg)),
            }
        };
        add(&self.c_values, c_option, &mut parsed.c_scan_options);
        add(&self.cxx_values, cxx_option, &mut parsed.cxx_scan_options);
    }
}

/// The type-specific behavior of an option.
#[derive(Debug, Clone)]
pub enum OptionEffect {
    /// Switches the command kind, e.g. `-c` or `-E`.
    Cmd(CommandKind),
    /// Forces the source language, e.g. `-x c++`.
    Lang(BTreeMap<String, FileFormat>),
    /// Names a response file with further arguments.
    RespFile,
    /// Dropped from the preprocessing command line.
    Delete,
    /// Forwarded to the scanner, possibly rewritten per language.
    Scan(ScanSpec),
    /// Triggers preprocess-only mode.
    Preprocess,
    /// Names the output target.
    Output,
    /// Names a file included before the source.
    PreInclude,
    /// Adds a system include path.
    SysIncPath,
    /// Recognized but otherwise uninterpreted; needed for options with
    /// space-separated arguments.
    Other,
}

impl OptionEffect {
    pub fn type_str(&self) -> &'static str {
        match self {
            OptionEffect::Cmd(_) => "cmd",
            OptionEffect::Lang(_) => "language",
            OptionEffect::RespFile => "response",
            OptionEffect::Delete => "delete",
            OptionEffect::Scan(_) => "scan",
            OptionEffect::Preprocess => "preprocess",
            OptionEffect::Output => "output",
            OptionEffect::PreInclude => "include",
            OptionEffect::SysIncPath => "isystem",
            OptionEffect::Other => "other",
        }
    }
}

/// One command line option of a tool, as declared in its profile.
#[derive(Debug, Clone)]
pub struct ToolOption {
    pub effect: OptionEffect,
    /// Aliases in declared order; the first is canonical.
    aliases: Vec<String>,
    /// Accepted argument formats in declared order; empty means no argument.
    formats: Vec<ArgFormat>,
    /// The profile's option prefix, used to tell an optional space-separated
    /// argument from the next option.
    prefix: Option<String>,
}

impl ToolOption {
    pub fn from_json(op: &Value, prefix: Option<&str>) -> Result<ToolOption> {
        let aliases = string_list(required(op, "aliases")?, "aliases", false)?;

        let mut formats = vec![];
        if let Some(v) = op.get("argFormat") {
            for f in as_array(v, "argFormat", false)? {
                let s = as_str(f, "argFormat")?;
                match ArgFormat::from_str(s) {
                    Some(format) => {
                        if !formats.contains(&format) {
                            formats.push(format);
                        }
                    }
                    None => return schema_err(format!("unknown argFormat '{}'", s)),
                }
            }
        }

        let ty = as_str(required(op, "type")?, "type")?;
        let effect = match ty {
            "cmd" => {
                let kind = as_str(required(op, "kind")?, "kind")?;
                match CommandKind::from_str(kind) {
                    Some(kind) => OptionEffect::Cmd(kind),
                    None => return schema_err(format!("unknown command kind '{}'", kind)),
                }
            }
            "language" => {
                let mut map = BTreeMap::new();
                for (k, v) in as_object(required(op, "argValues")?, "argValues")? {
                    let format = as_str(v, k)?;
                    match FileFormat::from_str(format) {
                        Some(format) => {
                            map.insert(k.clone(), format);
                        }
                        None => return schema_err(format!("unknown file format '{}'", format)),
                    }
                }
                OptionEffect::Lang(map)
            }
            "response" => OptionEffect::RespFile,
            "delete" => OptionEffect::Delete,
            "scan" => OptionEffect::Scan(ScanSpec::from_json(op)?),
            "preprocess" => OptionEffect::Preprocess,
            "output" => OptionEffect::Output,
            "include" => OptionEffect::PreInclude,
            "isystem" => OptionEffect::SysIncPath,
            "other" => OptionEffect::Other,
            _ => return schema_err(format!("unknown option type '{}'", ty)),
        };

        Ok(ToolOption {
            effect,
            aliases,
            formats,
            prefix: prefix.map(String::from),
        })
    }

    pub fn has_arg(&self) -> bool {
        !self.formats.is_empty()
    }

    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    /// Try to match the token at `pos`. On a match the cursor is advanced
    /// past the option and its argument, and the argument is returned
    /// (empty for flag options). The cursor is unchanged otherwise.
    pub fn match_and_get_arg(&self, args: &[String], pos: &mut usize) -> Option<String> {
        let token = &args[*pos];

        if self.formats.is_empty() {
            if self.aliases.iter().any(|a| a == token) {
                *pos += 1;
                return Some(String::new());
            }
            return None;
        }

        if self.formats.contains(&ArgFormat::Space) && self.aliases.iter().any(|a| a == token) {
            *pos += 1;
            // Only consume an argument if there is a next token and it does
            // not look like another option.
            if let Some(next) = args.get(*pos) {
                let looks_like_option = self
                    .prefix
                    .as_ref()
                    .map_or(false, |p| next.starts_with(p.as_str()));
                if !looks_like_option {
                    *pos += 1;
                    return Some(next.clone());
                }
            }
            return Some(String::new());
        }

        if self.formats.contains(&ArgFormat::Equal) {
            let mut parts = token.splitn(2, '=');
            if let (Some(name), Some(value)) = (parts.next(), parts.next()) {
                if self.aliases.iter().any(|a| a == name) {
                    *pos += 1;
                    return Some(value.to_string());
                }
            }
        }

        if self.formats.contains(&ArgFormat::Attached) {
            for alias in &self.aliases {
                if token.starts_with(alias.as_str()) {
                    let arg = token[alias.len()..].to_string();
                    *pos += 1;
                    return Some(arg);
                }
            }
        }

        None
    }

    /// Match the token at `pos` and run the option's effect on the parser
    /// state. Options whose effect reports "copy" have their original
    /// tokens appended to the preprocessing options.
    pub fn try_match(&self, args: &[String], pos: &mut usize, parsed: &mut ParsedWorkItem) -> bool {
        let start = *pos;
        match self.match_and_get_arg(args, pos) {
            Some(arg) => {
                if self.process(&arg, parsed) {
                    parsed.pp_options.extend_from_slice(&args[start..*pos]);
                }
                true
            }
            None => false,
        }
    }

    /// Run the type-specific effect; returns whether the option text should
    /// be copied into the preprocessing options.
    fn process(&self, arg: &str, parsed: &mut ParsedWorkItem) -> bool {
        match &self.effect {
            OptionEffect::Cmd(kind) => {
                parsed.kind = *kind;
                true
            }
            OptionEffect::Lang(map) => {
                if let Some(format) = map.get(arg) {
                    parsed.format = *format;
                }
                // The language intent is carried in the typed format, keep
                // the option off the preprocessing command line.
                false
            }
            OptionEffect::RespFile | OptionEffect::Delete | OptionEffect::Preprocess => false,
            OptionEffect::Scan(spec) => {
                spec.apply(arg, &self.aliases[0], parsed);
                true
            }
            OptionEffect::Output => {
                parsed.target = util::full_path_str(arg, Path::new(&parsed.dir));
                false
            }
            OptionEffect::PreInclude | OptionEffect::SysIncPath | OptionEffect::Other => true,
        }
    }

    /// Render the option with `arg` for a re-invocation, using the
    /// canonical alias and the first declared argument format.
    pub fn render(&self, arg: &str) -> Vec<String> {
        let alias = &self.aliases[0];
        match self.formats.first() {
            None => vec![alias.clone()],
            Some(ArgFormat::Attached) => vec![format!("{}{}", alias, arg)],
            Some(ArgFormat::Space) => vec![alias.clone(), arg.to_string()],
            Some(ArgFormat::Equal) => vec![format!("{}={}", alias, arg)],
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::stringvec;
    use serde_json::json;

    fn option(spec: serde_json::Value) -> ToolOption {
        ToolOption::from_json(&spec, Some("-")).unwrap()
    }

    #[test]
    fn test_arg_format_round_trip() {
        for format in &[ArgFormat::Attached, ArgFormat::Space, ArgFormat::Equal] {
            assert_eq!(ArgFormat::from_str(format.as_str()), Some(*format));
        }
        assert_eq!(ArgFormat::from_str("x"), None);
    }

    #[test]
    fn test_parse_failures() {
        let fails = vec![
            json!({}),
            json!({"aliases": "a"}),
            json!({"aliases": []}),
            json!({"aliases": [{}]}),
            json!({"aliases": ["-c"]}),
            json!({"aliases": ["-c"], "type": ""}),
            json!({"aliases": ["-c"], "type": "x"}),
            json!({"aliases": ["-c"], "type": "other", "argFormat": []}),
            json!({"aliases": ["-c"], "type": "other", "argFormat": ["x"]}),
            json!({"aliases": ["-c"], "type": "cmd"}),
            json!({"aliases": ["-c"], "type": "cmd", "kind": "make"}),
            json!({"aliases": ["-x"], "type": "language"}),
            json!({"aliases": ["-x"], "type": "language", "argValues": {}}),
            json!({"aliases": ["-x"], "type": "language", "argValues": {"x": "nope"}}),
            json!({"aliases": ["-s"], "type": "scan", "cArgValues": {"": "x"}}),
            json!({"aliases": ["-s"], "type": "scan", "scanArgFormat": "x"}),
        ];
        for fail in fails {
            assert!(
                ToolOption::from_json(&fail, Some("-")).is_err(),
                "should not parse {}",
                fail
            );
        }
    }

    #[test]
    fn test_match_no_arg() {
        let op = option(json!({"aliases": ["-c"], "type": "cmd", "kind": "compile"}));
        let args = stringvec!["-c", "foo.c"];
        let mut pos = 0;
        assert_eq!(op.match_and_get_arg(&args, &mut pos), Some(String::new()));
        assert_eq!(pos, 1);
        assert_eq!(op.match_and_get_arg(&args, &mut pos), None);
        assert_eq!(pos, 1);
    }

    #[test]
    fn test_match_space() {
        let op = option(json!({"aliases": ["-o"], "type": "output", "argFormat": ["space"]}));
        let args = stringvec!["-o", "foo.o"];
        let mut pos = 0;
        assert_eq!(op.match_and_get_arg(&args, &mut pos), Some("foo.o".into()));
        assert_eq!(pos, 2);
    }

    #[test]
    fn test_match_space_with_option_next() {
        // The next token starts with the option prefix, so the argument is
        // treated as optional and left in place.
        let op = option(json!({"aliases": ["-O"], "type": "other", "argFormat": ["space"]}));
        let args = stringvec!["-O", "-g"];
        let mut pos = 0;
        assert_eq!(op.match_and_get_arg(&args, &mut pos), Some(String::new()));
        assert_eq!(pos, 1);
    }

    #[test]
    fn test_match_space_at_end() {
        let op = option(json!({"aliases": ["-o"], "type": "output", "argFormat": ["space"]}));
        let args = stringvec!["-o"];
        let mut pos = 0;
        assert_eq!(op.match_and_get_arg(&args, &mut pos), Some(String::new()));
        assert_eq!(pos, 1);
    }

    #[test]
    fn test_match_equal() {
        let op = option(json!({"aliases": ["--sysroot"], "type": "other", "argFormat": ["equal"]}));
        let args = stringvec!["--sysroot=/opt/rootfs"];
        let mut pos = 0;
        assert_eq!(
            op.match_and_get_arg(&args, &mut pos),
            Some("/opt/rootfs".into())
        );
        assert_eq!(pos, 1);
    }

    #[test]
    fn test_match_attached() {
        let op = option(json!({"aliases": ["-I"], "type": "other", "argFormat": ["attached"]}));
        let args = stringvec!["-Iinclude"];
        let mut pos = 0;
        assert_eq!(op.match_and_get_arg(&args, &mut pos), Some("include".into()));
        assert_eq!(pos, 1);
    }

    #[test]
    fn test_render_round_trip() {
        let attached = option(json!({"aliases": ["-I"], "type": "other", "argFormat": ["attached"]}));
        assert_eq!(attached.render("include"), stringvec!["-Iinclude"]);

        let space = option(json!({"aliases": ["-o"], "type": "output", "argFormat": ["space"]}));
        assert_eq!(space.render("a.o"), stringvec!["-o", "a.o"]);

        let equal = option(json!({"aliases": ["--out"], "type": "output", "argFormat": ["equal"]}));
        assert_eq!(equal.render("a.o"), stringvec!["--out=a.o"]);

        let flag = option(json!({"aliases": ["-E"], "type": "preprocess"}));
        assert_eq!(flag.render(""), stringvec!["-E"]);

        // The canonical alias is the first declared one.
        let multi = option(
            json!({"aliases": ["-include", "--include"], "type": "include", "argFormat": ["space", "equal"]}),
        );
        assert_eq!(multi.render("pre.h"), stringvec!["-include", "pre.h"]);
    }

    #[test]
    fn test_process_cmd_copies() {
        let op = option(json!({"aliases": ["-c"], "type": "cmd", "kind": "compile"}));
        let args = stringvec!["-c"];
        let mut pos = 0;
        let mut parsed = ParsedWorkItem::default();
        assert!(op.try_match(&args, &mut pos, &mut parsed));
        assert_eq!(parsed.kind, CommandKind::Compile);
        assert_eq!(parsed.pp_options, stringvec!["-c"]);
    }

    #[test]
    fn test_process_lang_not_copied() {
        let op = option(json!({
            "aliases": ["-x"],
            "type": "language",
            "argFormat": ["space"],
            "argValues": {"c": "c", "c++": "c++"}
        }));
        let args = stringvec!["-x", "c++", "a.cc"];
        let mut pos = 0;
        let mut parsed = ParsedWorkItem::default();
        assert!(op.try_match(&args, &mut pos, &mut parsed));
        assert_eq!(pos, 2);
        assert_eq!(parsed.format, FileFormat::Cxx);
        assert!(parsed.pp_options.is_empty());
    }

    #[test]
    fn test_process_output_sets_target() {
        let op = option(json!({"aliases": ["-o"], "type": "output", "argFormat": ["space"]}));
        let args = stringvec!["-o", "obj/foo.o"];
        let mut pos = 0;
        let mut parsed = ParsedWorkItem {
            dir: "/work".into(),
            ..Default::default()
        };
        assert!(op.try_match(&args, &mut pos, &mut parsed));
        assert_eq!(parsed.target, "/work/obj/foo.o");
        assert!(parsed.pp_options.is_empty());
    }

    #[test]
    fn test_process_scan_rewrites_per_language() {
        let op = option(json!({
            "aliases": ["-std"],
            "type": "scan",
            "argFormat": ["equal"],
            "scanArgFormat": "equal",
            "cArgValues": {"gnu90": "c90"},
            "cxxArgValues": {"gnu++11": "c++11"}
        }));
        let args = stringvec!["-std=gnu90"];
        let mut pos = 0;
        let mut parsed = ParsedWorkItem::default();
        assert!(op.try_match(&args, &mut pos, &mut parsed));
        assert_eq!(parsed.c_scan_options, stringvec!["-std=c90"]);
        // Unmapped value passes through for the other language.
        assert_eq!(parsed.cxx_scan_options, stringvec!["-std=gnu90"]);
        assert_eq!(parsed.pp_options, stringvec!["-std=gnu90"]);
    }

    #[test]
    fn test_process_scan_flag_uses_alias() {
        let op = option(json!({
            "aliases": ["-fshort-enums"],
            "type": "scan",
            "cxxScanOption": "-fshort-enums-cxx"
        }));
        let args = stringvec!["-fshort-enums"];
        let mut pos = 0;
        let mut parsed = ParsedWorkItem::default();
        assert!(op.try_match(&args, &mut pos, &mut parsed));
        assert_eq!(parsed.c_scan_options, stringvec!["-fshort-enums"]);
        assert_eq!(parsed.cxx_scan_options, stringvec!["-fshort-enums-cxx"]);
    }
}
