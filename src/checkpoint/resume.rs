//! Where a job picks up after an interrupted attempt.
//!
//! Kept free of IO and timing so the resume arithmetic can be tested without
//! the retry loop around it.

use super::store::Checkpoint;

const STAGE_SEPARATOR: &str = "\n\n";

/// Output of one successful stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Increment {
    pub text: String,
    /// Tokens consumed producing it (context plus output)
    pub tokens: u64,
}

/// Position within a job's stages plus everything produced so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePlan {
    pub next_stage: u32,
    pub total_stages: u32,
    pub partial_output: String,
    pub tokens_used: u64,
}

impl ResumePlan {
    pub fn fresh(total_stages: u32) -> Self {
        Self {
            next_stage: 0,
            total_stages: total_stages.max(1),
            partial_output: String::new(),
            tokens_used: 0,
        }
    }

    /// Continue from `checkpoint`, or from scratch when there is none.
    pub fn from_checkpoint(checkpoint: Option<&Checkpoint>, total_stages: u32) -> Self {
        let total_stages = total_stages.max(1);
        match checkpoint {
            Some(cp) => Self {
                next_stage: cp.stage.min(total_stages),
                total_stages,
                partial_output: cp.partial_output.clone(),
                tokens_used: cp.tokens_used,
            },
            None => Self::fresh(total_stages),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.next_stage >= self.total_stages
    }

    pub fn remaining_stages(&self) -> u32 {
        self.total_stages.saturating_sub(self.next_stage)
    }

    /// Fold a finished stage into the plan.
    pub fn advance(mut self, increment: Increment) -> Self {
        if !self.partial_output.is_empty() && !increment.text.is_empty() {
            self.partial_output.push_str(STAGE_SEPARATOR);
        }
        self.partial_output.push_str(&increment.text);
        self.tokens_used += increment.tokens;
        self.next_stage = (self.next_stage + 1).min(self.total_stages);
        self
    }

    /// Last `max_chars` characters of the output so far, for continuity context.
    pub fn tail(&self, max_chars: usize) -> &str {
        let total = self.partial_output.chars().count();
        if total <= max_chars {
            return &self.partial_output;
        }
        let skip = total - max_chars;
        let start = self
            .partial_output
            .char_indices()
            .nth(skip)
            .map(|(idx, _)| idx)
            .unwrap_or(self.partial_output.len());
        &self.partial_output[start..]
    }
}
