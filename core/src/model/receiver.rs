use super::OprId;
use serde::Serialize;

/// How the operators of the current compiled sequence consume a variable.
///
/// Dependencies satisfied by static inference (a shape or host value known
/// before execution) are not counted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct VarReceiverInfo {
    /// Output spec entries asking for the var without a callback.
    pub nr_direct_comp_req: usize,
    /// Operators reading the device value.
    pub dev_value: usize,
    /// Last operator of the sequence reading the device value.
    #[serde(skip)]
    pub last_dev_value_reader: Option<OprId>,
    /// Operators needing only the shape.
    pub shape: usize,
    /// Operators needing the value on host.
    pub host_value: usize,
    /// Value readers that accept an empty tensor.
    pub allow_empty_value: usize,
}

impl VarReceiverInfo {
    pub fn empty(&self) -> bool {
        self.nr_direct_comp_req == 0 && self.dev_value == 0 && self.shape == 0 && self.host_value == 0
    }

    pub fn value_needed(&self) -> bool {
        self.nr_direct_comp_req > 0 || self.dev_value > 0 || self.host_value > 0
    }

    /// Empty values are only acceptable if every value reader tolerates them.
    pub fn is_empty_allowed(&self) -> bool {
        self.allow_empty_value == self.host_value + self.dev_value
    }

    pub fn value_readers(&self) -> usize {
        self.dev_value + self.host_value
    }
}
