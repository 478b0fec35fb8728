//! File attachments for binary tool arguments.

use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use registry::{Arguments, ToolDescriptor};
use runtime::ArgumentHook;
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};

/// Files given with `--attach [field=]path`.
///
/// A file bound to a field fills that field; an unbound file fills any
/// binary field that has no bound file.
#[derive(Debug, Default)]
pub struct Attachments {
    entries: Vec<(Option<String>, PathBuf)>,
}

impl Attachments {
    pub fn parse(specs: &[String]) -> Result<Self> {
        let entries = specs
            .iter()
            .map(|spec| match spec.split_once('=') {
                Some((field, path)) if !field.is_empty() && !path.is_empty() => {
                    Ok((Some(field.to_string()), PathBuf::from(path)))
                }
                Some(_) => Err(Error::InvalidArgument(format!(
                    "attachment `{spec}` must be field=path"
                ))),
                None => Ok((None, PathBuf::from(spec))),
            })
            .collect::<Result<_>>()?;
        Ok(Self { entries })
    }

    fn file_for(&self, field: &str) -> Option<&PathBuf> {
        self.entries
            .iter()
            .find(|(name, _)| name.as_deref() == Some(field))
            .or_else(|| self.entries.iter().find(|(name, _)| name.is_none()))
            .map(|(_, path)| path)
    }
}

impl ArgumentHook for Attachments {
    fn prepare(&self, tool: &ToolDescriptor, arguments: &mut Arguments) -> runtime::Result<()> {
        for field in tool.parameter_schema.binary_fields() {
            let Some(path) = self.file_for(field) else {
                continue;
            };
            let bytes = std::fs::read(path).map_err(|e| {
                runtime::Error::Config(format!("cannot read {}: {e}", path.display()))
            })?;
            debug!(tool = %tool.name, field, bytes = bytes.len(), "attached file");
            arguments.insert(field.to_string(), Value::String(STANDARD.encode(bytes)));
        }
        Ok(())
    }
}
