//! # HL7 Core
//!
//! HL7集成引擎的核心模块，提供统一错误定义和通用工具。

pub mod error;
pub mod utils;

pub use error::{EngineError, Result};
