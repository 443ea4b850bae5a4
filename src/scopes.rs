//! Scope hierarchy for rule evaluation.
//!
//! Rules declare exactly one scope. The static axis nests
//! `instruction ⊂ basic block ⊂ function ⊂ file`; the dynamic axis nests
//! `call ⊂ thread ⊂ process ⊂ file`. A rule only ever sees the feature set
//! visible at one instance of its declared scope.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::features::FeatureKind;

/// Which extraction backend family a scope belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeAxis {
    Static,
    Dynamic,
}

/// Granularity at which a rule is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    File,
    Function,
    BasicBlock,
    Instruction,
    Process,
    Thread,
    Call,
}

impl Scope {
    /// Axis this scope lives on. `File` is the shared root of both axes.
    pub fn axis(&self) -> Option<ScopeAxis> {
        match self {
            Scope::File => None,
            Scope::Function | Scope::BasicBlock | Scope::Instruction => Some(ScopeAxis::Static),
            Scope::Process | Scope::Thread | Scope::Call => Some(ScopeAxis::Dynamic),
        }
    }

    /// Nesting depth, 0 at the leaves. Used for the bottom-up sweep order.
    pub fn level(&self) -> u8 {
        match self {
            Scope::Instruction | Scope::Call => 0,
            Scope::BasicBlock | Scope::Thread => 1,
            Scope::Function | Scope::Process => 2,
            Scope::File => 3,
        }
    }

    /// True if an instance of this scope can contain an instance of `other`.
    ///
    /// `File` contains every scope on both axes; otherwise containment only
    /// holds within one axis. A scope contains itself, which is what makes a
    /// same-scope rule reference legal.
    pub fn contains(&self, other: Scope) -> bool {
        if *self == Scope::File {
            return true;
        }
        self.axis() == other.axis() && self.level() >= other.level()
    }

    /// Whether features of `kind` may be predicated on directly at this scope.
    ///
    /// Whole-file observations (imports, exports, sections, function names)
    /// are only addressable at file scope; instruction-level observations
    /// (mnemonics, API calls, numbers) never are. Global characteristics and
    /// matched-rule features are visible everywhere.
    pub fn supports(&self, kind: FeatureKind) -> bool {
        use FeatureKind::*;
        match kind {
            Os | Arch | Format | MatchedRule => true,
            String | Substring | Regex | Characteristic => true,
            Import | Export | Section | FunctionName => *self == Scope::File,
            Mnemonic => matches!(self, Scope::Instruction | Scope::BasicBlock | Scope::Function),
            Api | Number => matches!(
                self,
                Scope::Instruction
                    | Scope::BasicBlock
                    | Scope::Function
                    | Scope::Call
                    | Scope::Thread
                    | Scope::Process
            ),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Scope::File => "file",
            Scope::Function => "function",
            Scope::BasicBlock => "basic block",
            Scope::Instruction => "instruction",
            Scope::Process => "process",
            Scope::Thread => "thread",
            Scope::Call => "call",
        };
        write!(f, "{name}")
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "file" => Ok(Scope::File),
            "function" => Ok(Scope::Function),
            "basic block" | "basic_block" => Ok(Scope::BasicBlock),
            "instruction" => Ok(Scope::Instruction),
            "process" => Ok(Scope::Process),
            "thread" => Ok(Scope::Thread),
            "call" => Ok(Scope::Call),
            other => Err(format!("unknown scope '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_contains_both_axes() {
        assert!(Scope::File.contains(Scope::Instruction));
        assert!(Scope::File.contains(Scope::Call));
        assert!(Scope::File.contains(Scope::File));
    }

    #[test]
    fn test_containment_is_axis_local() {
        assert!(Scope::Function.contains(Scope::BasicBlock));
        assert!(Scope::Thread.contains(Scope::Call));
        assert!(!Scope::Function.contains(Scope::Thread));
        assert!(!Scope::Thread.contains(Scope::Instruction));
        assert!(!Scope::Instruction.contains(Scope::Function));
    }

    #[test]
    fn test_scope_contains_itself() {
        assert!(Scope::Thread.contains(Scope::Thread));
        assert!(Scope::BasicBlock.contains(Scope::BasicBlock));
    }

    #[test]
    fn test_file_only_features() {
        assert!(Scope::File.supports(FeatureKind::Import));
        assert!(!Scope::Function.supports(FeatureKind::Import));
        assert!(!Scope::Call.supports(FeatureKind::Export));
    }

    #[test]
    fn test_instruction_features_not_at_file() {
        assert!(Scope::Instruction.supports(FeatureKind::Mnemonic));
        assert!(Scope::Thread.supports(FeatureKind::Api));
        assert!(!Scope::File.supports(FeatureKind::Api));
        assert!(!Scope::File.supports(FeatureKind::Mnemonic));
    }

    #[test]
    fn test_scope_round_trip() {
        for scope in [
            Scope::File,
            Scope::Function,
            Scope::BasicBlock,
            Scope::Instruction,
            Scope::Process,
            Scope::Thread,
            Scope::Call,
        ] {
            assert_eq!(scope.to_string().parse::<Scope>().unwrap(), scope);
        }
    }
}
