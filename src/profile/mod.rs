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

//! Declarative toolchain knowledge: how to recognize tool invocations,
//! parse their command lines and rebuild preprocessing command lines.

pub mod option;
pub mod parsed;
pub mod tool;
pub mod toolchain;

pub use self::option::{ArgFormat, OptionEffect, ToolOption};
pub use self::parsed::{CommandKind, FileFormat, ParsedWorkItem};
pub use self::tool::ToolProfile;
pub use self::toolchain::ToolchainProfile;

use serde_json::{Map, Value};

use crate::errors::*;

// Schema checks shared by the profile loaders. All failures are
// IncorrectProfile, fatal for the profile being loaded.

pub(crate) fn schema_err<T>(msg: String) -> Result<T> {
    Err(ErrorKind::IncorrectProfile(msg).into())
}

pub(crate) fn required<'a>(json: &'a Value, key: &str) -> Result<&'a Value> {
    match json.get(key) {
        Some(v) => Ok(v),
        None => schema_err(format!("property '{}' is missing", key)),
    }
}

pub(crate) fn as_str<'a>(v: &'a Value, what: &str) -> Result<&'a str> {
    match v.as_str() {
        Some(s) if !s.is_empty() => Ok(s),
        _ => schema_err(format!("property '{}' is not a nonempty string: {}", what, v)),
    }
}

pub(crate) fn as_str_allow_empty<'a>(v: &'a Value, what: &str) -> Result<&'a str> {
    match v.as_str() {
        Some(s) => Ok(s),
        None => schema_err(format!("property '{}' is not a string: {}", what, v)),
    }
}

pub(crate) fn as_array<'a>(v: &'a Value, what: &str, allow_empty: bool) -> Result<&'a Vec<Value>> {
    match v.as_array() {
        Some(a) if allow_empty || !a.is_empty() => Ok(a),
        _ => schema_err(format!("property '{}' is not a nonempty array: {}", what, v)),
    }
}

pub(crate) fn as_object<'a>(v: &'a Value, what: &str) -> Result<&'a Map<String, Value>> {
    match v.as_object() {
        Some(o) if !o.is_empty() => Ok(o),
        _ => schema_err(format!("property '{}' is not a nonempty object: {}", what, v)),
    }
}

/// An array of nonempty strings.
pub(crate) fn string_list(v: &Value, what: &str, allow_empty: bool) -> Result<Vec<String>> {
    as_array(v, what, allow_empty)?
        .iter()
        .map(|e| as_str(e, what).map(String::from))
        .collect()
}
