//! Scripted generator: a deterministic offline backend that replays a queue
//! of canned responses. Used by the test suite and by `--offline` smoke runs
//! where no API key is available.

use std::collections::VecDeque;

use super::{GeneratedImage, GenerateRequest, Generator, GeneratorError};

pub struct ScriptedGenerator {
    responses: VecDeque<Result<GeneratedImage, GeneratorError>>,
    calls: usize,
    seeds_seen: Vec<u32>,
}

impl ScriptedGenerator {
    pub fn new(responses: Vec<Result<GeneratedImage, GeneratorError>>) -> ScriptedGenerator {
        ScriptedGenerator {
            responses: responses.into(),
            calls: 0,
            seeds_seen: Vec::new(),
        }
    }

    /// Every call returns the same PNG bytes; convenient when only the audit
    /// path matters.
    pub fn repeating(bytes: Vec<u8>) -> ScriptedGenerator {
        let mut g = ScriptedGenerator::new(Vec::new());
        g.responses.push_back(Ok(GeneratedImage {
            image_bytes: bytes,
            mime: "image/png".to_string(),
            model_id: "scripted".to_string(),
            reasoning_token: None,
        }));
        g
    }

    pub fn calls(&self) -> usize {
        self.calls
    }

    pub fn seeds_seen(&self) -> &[u32] {
        &self.seeds_seen
    }
}

impl Generator for ScriptedGenerator {
    fn generate(&mut self, req: &GenerateRequest) -> Result<GeneratedImage, GeneratorError> {
        self.calls += 1;
        self.seeds_seen.push(req.seed);
        match self.responses.pop_front() {
            Some(r) => {
                // A single remaining canned response repeats forever.
                if self.responses.is_empty() {
                    if let Ok(img) = &r {
                        self.responses.push_back(Ok(img.clone()));
                    }
                }
                r
            }
            None => Err(GeneratorError::Transport(
                "scripted generator exhausted".to_string(),
            )),
        }
    }

    fn model_id(&self) -> &str {
        "scripted"
    }

    fn adapter_version(&self) -> &str {
        "scripted/1"
    }
}
