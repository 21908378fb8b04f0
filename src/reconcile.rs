//! Output reconciliation: separating a transaction's outputs into
//! expected/explicit, surprise/implicit, and missing multisets.
//!
//! All comparisons are multiplicity-preserving: two outputs paying the same
//! script the same amount are tracked individually, never collapsed.

use crate::bitcoin::ScriptBuf;
use crate::error::UtxoSignerError;

/// An output amount, or the `max` wildcard used for sweep-style recipients
/// whose final amount is fee-dependent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputValue {
    Exact(u64),
    Max,
}

impl OutputValue {
    /// Wildcard-aware equality: `Max` matches any value.
    fn matches(&self, other: &OutputValue) -> bool {
        match (self, other) {
            (OutputValue::Max, _) | (_, OutputValue::Max) => true,
            (OutputValue::Exact(a), OutputValue::Exact(b)) => a == b,
        }
    }
}

/// The canonical unit compared during reconciliation.
///
/// `external` is `None` until the output has been classified against the
/// wallet keys; `optional` marks expected outputs whose absence is tolerated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComparableOutput {
    pub script: ScriptBuf,
    pub value: OutputValue,
    pub external: Option<bool>,
    pub optional: bool,
}

impl ComparableOutput {
    pub fn new(script: ScriptBuf, value: u64) -> Self {
        Self {
            script,
            value: OutputValue::Exact(value),
            external: None,
            optional: false,
        }
    }

    fn matches(&self, other: &ComparableOutput) -> bool {
        self.script == other.script && self.value.matches(&other.value)
    }

    pub fn is_external(&self) -> bool {
        self.external == Some(true)
    }
}

/// All elements of `first` not matched one-for-one against `second`.
///
/// For each element of `second`, the first structurally matching element
/// remaining in a working copy of `first` is removed; whatever is left is the
/// difference. Order-independent in its result, multiplicity-preserving.
pub fn output_difference(
    first: &[ComparableOutput],
    second: &[ComparableOutput],
) -> Vec<ComparableOutput> {
    let mut remaining: Vec<Option<&ComparableOutput>> = first.iter().map(Some).collect();

    for output in second {
        if let Some(slot) = remaining
            .iter_mut()
            .find(|slot| slot.map_or(false, |candidate| candidate.matches(output)))
        {
            *slot = None;
        }
    }

    remaining.into_iter().flatten().cloned().collect()
}

/// The three-way split produced by reconciling actual against expected
/// outputs.
#[derive(Debug, Clone, Default)]
pub struct ReconciliationResult {
    /// Present and expected.
    pub explicit_outputs: Vec<ComparableOutput>,
    /// Present but not expected (change, or a platform fee output).
    pub implicit_outputs: Vec<ComparableOutput>,
    /// Expected but absent.
    pub missing_outputs: Vec<ComparableOutput>,
}

/// Reconcile a transaction's actual outputs against the expected recipient
/// list. Optional expected outputs are excluded from `missing_outputs` even
/// when absent.
pub fn reconcile(
    actual: &[ComparableOutput],
    expected: &[ComparableOutput],
) -> ReconciliationResult {
    let implicit_outputs = output_difference(actual, expected);
    let explicit_outputs = output_difference(actual, &implicit_outputs);
    let missing_outputs = output_difference(expected, actual)
        .into_iter()
        .filter(|output| !output.optional)
        .collect();

    ReconciliationResult {
        explicit_outputs,
        implicit_outputs,
        missing_outputs,
    }
}

/// Sum the values of the external outputs in a reconciled set.
/// `Max` placeholders never contribute to spend sums.
pub fn external_spend_amount(outputs: &[ComparableOutput]) -> Result<u64, UtxoSignerError> {
    outputs
        .iter()
        .filter(|o| o.is_external())
        .try_fold(0u64, |total, output| match output.value {
            OutputValue::Exact(value) => total
                .checked_add(value)
                .ok_or_else(|| UtxoSignerError::new("spend amount overflow")),
            OutputValue::Max => Ok(total),
        })
}
