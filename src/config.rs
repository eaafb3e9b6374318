use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Default upper bound for an encoded bytecode program, in bytes.
pub const DEFAULT_MAX_BYTECODE_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub max_bytecode_size: usize,

    // work-geometry tuning
    pub gpu_block_x: u64,
    pub gpu_block_2d_x: u64,
    pub gpu_block_2d_y: u64,
    pub gpu_warp: u64,
    pub adjust_irregular: bool,
    pub cpu_block: u64,
    pub fpga_warp: u64,
    pub fpga_local_work: u64,

    /// Rewrite scalar objects on every execution instead of once per context.
    pub benchmarking_mode: bool,
    pub queue_thread_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_bytecode_size: DEFAULT_MAX_BYTECODE_SIZE,

            gpu_block_x: 256,
            gpu_block_2d_x: 4,
            gpu_block_2d_y: 4,
            gpu_warp: 32,
            adjust_irregular: false,
            cpu_block: 128,
            fpga_warp: 32,
            fpga_local_work: 64,

            benchmarking_mode: false,
            queue_thread_name: "accelvm-queue".to_string(),
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Parse a JSON document; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_bytecode_size < 16 {
            return Err(Error::config("max_bytecode_size must be at least 16 bytes"));
        }

        let tunables = [
            ("gpu_block_x", self.gpu_block_x),
            ("gpu_block_2d_x", self.gpu_block_2d_x),
            ("gpu_block_2d_y", self.gpu_block_2d_y),
            ("gpu_warp", self.gpu_warp),
            ("cpu_block", self.cpu_block),
            ("fpga_warp", self.fpga_warp),
            ("fpga_local_work", self.fpga_local_work),
        ];
        for (name, value) in tunables {
            if value == 0 {
                return Err(Error::config(format!("{} must be > 0", name)));
            }
        }

        if self.queue_thread_name.is_empty() {
            return Err(Error::config("queue_thread_name must not be empty"));
        }

        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn max_bytecode_size(mut self, bytes: usize) -> Self {
        self.config.max_bytecode_size = bytes;
        self
    }

    pub fn gpu_block_x(mut self, block: u64) -> Self {
        self.config.gpu_block_x = block;
        self
    }

    pub fn gpu_block_2d(mut self, x: u64, y: u64) -> Self {
        self.config.gpu_block_2d_x = x;
        self.config.gpu_block_2d_y = y;
        self
    }

    pub fn adjust_irregular(mut self, enable: bool) -> Self {
        self.config.adjust_irregular = enable;
        self
    }

    pub fn cpu_block(mut self, block: u64) -> Self {
        self.config.cpu_block = block;
        self
    }

    pub fn fpga(mut self, warp: u64, local_work: u64) -> Self {
        self.config.fpga_warp = warp;
        self.config.fpga_local_work = local_work;
        self
    }

    pub fn benchmarking_mode(mut self, enable: bool) -> Self {
        self.config.benchmarking_mode = enable;
        self
    }

    pub fn queue_thread_name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.queue_thread_name = name.into();
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}
