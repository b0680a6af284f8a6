/*
Copyright 2025 Connor Nolan

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use anyhow::Result;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Source files are read as text; object and executable images as raw
/// bytes. Tests substitute an in-memory implementation.
pub trait FileReader {
    fn read_to_string(&self, path: &Path) -> Result<String>;
    fn read_binary(&self, path: &Path) -> Result<Vec<u8>>;
}

// production file reader
pub struct DiskFileReader;

impl FileReader for DiskFileReader {
    fn read_to_string(&self, path: &Path) -> Result<String> {
        Ok(fs::read_to_string(path)?)
    }

    fn read_binary(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(fs::read(path)?)
    }
}

// mock file reader for testing
#[derive(Default)]
pub struct MockFileReader {
    files: HashMap<PathBuf, Vec<u8>>,
}

impl MockFileReader {
    pub fn add_file(&mut self, path: &str, content: &str) {
        self.files
            .insert(PathBuf::from(path), content.as_bytes().to_vec());
    }

    pub fn add_binary_file(&mut self, path: &str, content: &[u8]) {
        self.files.insert(PathBuf::from(path), content.to_vec());
    }
}

impl FileReader for MockFileReader {
    fn read_to_string(&self, path: &Path) -> Result<String> {
        let bytes = self
            .files
            .get(path)
            .ok_or_else(|| anyhow::anyhow!("Mock file not found: {}", path.display()))?;
        Ok(String::from_utf8(bytes.clone())?)
    }

    fn read_binary(&self, path: &Path) -> Result<Vec<u8>> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Mock file not found: {}", path.display()))
    }
}
