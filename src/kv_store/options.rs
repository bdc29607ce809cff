use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{b_tree::b_node::Thresholds, prelude::*};

pub const MIN_PAGE_SIZE: usize = 128;
// node offsets are u16
pub const MAX_PAGE_SIZE: usize = 1 << 16;

lazy_static! {
    static ref OS_PAGE_SIZE: usize = os_page_size();
}

fn os_page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

/// Database configuration. Fields missing from a JSON document keep their
/// defaults.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub page_size: usize,
    pub min_fill_percent: f32,
    pub max_fill_percent: f32,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            page_size: *OS_PAGE_SIZE,
            min_fill_percent: 0.5,
            max_fill_percent: 0.95,
        }
    }
}

impl Options {
    pub fn from_json(json: &str) -> Result<Options> {
        let options: Options = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Options> {
        let json = fs::read_to_string(path)?;
        Options::from_json(&json)
    }

    pub fn page_size(mut self, page_size: usize) -> Options {
        self.page_size = page_size;
        self
    }

    pub fn fill_percents(mut self, min_fill_percent: f32, max_fill_percent: f32) -> Options {
        self.min_fill_percent = min_fill_percent;
        self.max_fill_percent = max_fill_percent;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size) {
            return Err(Error::InvalidOptions(f!(
                "page size {} is outside {}..={}",
                self.page_size,
                MIN_PAGE_SIZE,
                MAX_PAGE_SIZE
            )));
        }
        if !self.page_size.is_power_of_two() {
            return Err(Error::InvalidOptions(f!(
                "page size {} is not a power of two",
                self.page_size
            )));
        }

        let fill_ok = 0.0 < self.min_fill_percent
            && self.min_fill_percent < self.max_fill_percent
            && self.max_fill_percent <= 1.0;
        if !fill_ok {
            return Err(Error::InvalidOptions(f!(
                "fill percents must satisfy 0 < min ({}) < max ({}) <= 1",
                self.min_fill_percent,
                self.max_fill_percent
            )));
        }
        Ok(())
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            page_size: self.page_size,
            min_fill_percent: self.min_fill_percent,
            max_fill_percent: self.max_fill_percent,
        }
    }
}
