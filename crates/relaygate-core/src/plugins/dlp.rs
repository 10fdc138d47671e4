//! Data masking of sensitive values in agent output
//!
//! The per-connection config lists which info types to mask. Masking is a
//! pipeline transform, so audit and indexing record the masked text the
//! client receives. The rewritten packet carries a JSON summary.

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use std::borrow::Cow;
use tracing::debug;

use crate::context::SessionContext;
use crate::packet::{Component, Packet, spec, types};
use crate::plugin::{Plugin, PluginError};

const PATTERNS: &[(&str, &str)] = &[
    ("EMAIL_ADDRESS", r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}"),
    ("CREDIT_CARD_NUMBER", r"\b(?:\d[ \-]?){13,16}\b"),
    ("PHONE_NUMBER", r"\+?\d{1,3}[ .\-]?\(?\d{3}\)?[ .\-]?\d{3}[ .\-]?\d{4}\b"),
    ("IP_ADDRESS", r"\b(?:\d{1,3}\.){3}\d{1,3}\b"),
    ("API_KEY", r"\b(?:sk|key|pk)-[A-Za-z0-9]{20,}"),
    ("AUTH_TOKEN", r"Bearer [A-Za-z0-9._\-]{20,}"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InfoTypeCount {
    pub info_type: String,
    pub count: usize,
}

pub struct DataMaskingPlugin {
    rules: Vec<(&'static str, Regex)>,
}

impl DataMaskingPlugin {
    pub fn new() -> Result<Self, regex::Error> {
        let rules = PATTERNS
            .iter()
            .map(|(name, pattern)| Regex::new(pattern).map(|re| (*name, re)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn known_info_types() -> impl Iterator<Item = &'static str> {
        PATTERNS.iter().map(|(name, _)| *name)
    }

    /// Mask the enabled info types, returning the text and per-type counts
    pub fn redact<'a>(&self, text: &'a str, enabled: &[String]) -> (Cow<'a, str>, Vec<InfoTypeCount>) {
        let mut result: Cow<'a, str> = Cow::Borrowed(text);
        let mut summary = Vec::new();
        for (name, re) in &self.rules {
            if !enabled.iter().any(|e| e.eq_ignore_ascii_case(name)) {
                continue;
            }
            let count = re.find_iter(&result).count();
            if count == 0 {
                continue;
            }
            let replaced = re.replace_all(&result, format!("[{name}]").as_str()).into_owned();
            result = Cow::Owned(replaced);
            summary.push(InfoTypeCount {
                info_type: name.to_string(),
                count,
            });
        }
        (result, summary)
    }
}

#[async_trait]
impl Plugin for DataMaskingPlugin {
    fn name(&self) -> &str {
        super::DLP
    }

    async fn transform(
        &self,
        ctx: &SessionContext,
        pkt: &Packet,
    ) -> Result<Option<Packet>, PluginError> {
        let Some(config) = ctx.plugin_config.as_ref().filter(|c| c.enabled) else {
            return Ok(None);
        };
        if pkt.component != Component::Agent
            || !(pkt.is_type(types::WRITE_STDOUT) || pkt.is_type(types::WRITE_STDERR))
        {
            return Ok(None);
        }
        // binary output is relayed untouched
        let Ok(text) = std::str::from_utf8(&pkt.payload) else {
            return Ok(None);
        };
        let (masked, summary) = self.redact(text, &config.config);
        if summary.is_empty() {
            return Ok(None);
        }
        debug!(
            "session {} masked {} values in {}",
            ctx.sid,
            summary.iter().map(|s| s.count).sum::<usize>(),
            pkt.packet_type
        );
        let summary_json = serde_json::to_vec(&summary)
            .map_err(|e| PluginError::Internal(format!("encoding masking summary: {e}")))?;
        let mut rewritten = pkt.clone().with_payload(masked.into_owned());
        rewritten
            .spec
            .insert(spec::DLP_SUMMARY.to_string(), summary_json);
        Ok(Some(rewritten))
    }
}
