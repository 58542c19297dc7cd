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
use std::io::Write;
use std::path::Path;

/// A `Vec<String>` from string literals.
#[macro_export]
macro_rules! stringvec {
    ( $( $x:expr ),* $(,)? ) => {
        vec![ $( $x.to_string(), )* ]
    };
}

pub fn write_file(path: &Path, content: &str) {
    let mut f = fs::File::create(path).unwrap();
    f.write_all(content.as_bytes()).unwrap();
}

/// Write an executable `#!/bin/sh` stub, used as a stand-in compiler.
#[cfg(unix)]
pub fn write_script(path: &Path, content: &str) {
    use std::os::unix::fs::PermissionsExt;
    write_file(path, content);
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}
