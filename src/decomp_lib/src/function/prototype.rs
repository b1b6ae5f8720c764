//! Function prototypes, calling-convention effects, and call sites.

use crate::address::{Address, VarnodeData};
use crate::datatype::DataType;
use crate::prelude::*;

use std::sync::Arc;

use super::super::data_flow::OpId;

/// The data-flow effect of a call on one storage range.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum EffectType {
    /// The call does not touch the range (callee-saved storage).
    Unaffected,
    /// The call destroys the range unconditionally.
    KilledByCall,
    /// The range holds the return address.
    ReturnAddress,
    /// Nothing is known; data-flow through the call must be made explicit.
    Unknown,
}

/// An [`EffectType`] attached to a storage range.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct EffectRecord {
    /// The affected storage.
    pub range: VarnodeData,
    /// The effect of a call on that storage.
    pub effect: EffectType,
}

impl EffectRecord {
    /// Returns a new effect record.
    pub fn new(range: VarnodeData, effect: EffectType) -> EffectRecord {
        EffectRecord { range, effect }
    }

    /// Returns true iff the record covers the whole range
    /// `[addr, addr + size)`.
    pub fn covers(&self, addr: &Address, size: u32) -> bool {
        match addr.overlap(0, &self.range.addr, self.range.size as u64) {
            Some(skip) => skip + size as u64 <= self.range.size as u64,
            None => false,
        }
    }
}

/// A named calling convention: default effects and potential parameter and
/// return storage.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default)]
pub struct ProtoModel {
    /// The name of the model.
    pub name: String,
    /// Default effects of a call under this model.
    pub effects: Vec<EffectRecord>,
    /// Storage ranges that can carry input parameters, in allocation order.
    pub input_ranges: Vec<VarnodeData>,
    /// Storage ranges that can carry the return value.
    pub output_ranges: Vec<VarnodeData>,
}

impl ProtoModel {
    /// Returns a new empty model with the given name.
    pub fn new(name: &str) -> ProtoModel {
        ProtoModel {
            name: name.to_string(),
            ..Default::default()
        }
    }
}

/// One recovered or declared parameter or return value.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct ProtoParameter {
    /// The name of the parameter, if known.
    pub name: Option<String>,
    /// The storage of the parameter.
    pub storage: VarnodeData,
    /// The data-type of the parameter.
    pub datatype: Arc<DataType>,
}

/// The prototype of one function: calling convention plus declared or
/// recovered parameters and return storage.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default)]
pub struct FuncProto {
    /// The underlying calling convention.
    pub model: ProtoModel,
    /// The input parameters.
    pub inputs: Vec<ProtoParameter>,
    /// The return value, if the function returns one.
    pub output: Option<ProtoParameter>,
    /// The inputs are declared and may not be changed by recovery.
    pub input_locked: bool,
    /// The output is declared and may not be changed by recovery.
    pub output_locked: bool,
}

impl FuncProto {
    /// Returns a new unlocked prototype under the given model.
    pub fn new(model: ProtoModel) -> FuncProto {
        FuncProto {
            model,
            ..Default::default()
        }
    }

    /// Returns the effect of a call on the given storage range.
    ///
    /// The most specific covering record wins; storage without a record has
    /// an unknown effect.
    pub fn effect_for(&self, addr: &Address, size: u32) -> EffectType {
        let mut best: Option<(u32, EffectType)> = None;
        for record in self.model.effects.iter() {
            if record.covers(addr, size) {
                match best {
                    Some((prev_size, _)) if prev_size <= record.range.size => (),
                    _ => best = Some((record.range.size, record.effect)),
                }
            }
        }
        best.map(|(_, effect)| effect).unwrap_or(EffectType::Unknown)
    }

    /// Returns true iff the range can hold the return value.
    pub fn possible_output_param(&self, addr: &Address, size: u32) -> bool {
        self.model
            .output_ranges
            .iter()
            .any(|range| EffectRecord::new(*range, EffectType::Unknown).covers(addr, size))
    }

    /// Returns true iff the range can hold an input parameter.
    pub fn possible_input_param(&self, addr: &Address, size: u32) -> bool {
        self.model
            .input_ranges
            .iter()
            .any(|range| EffectRecord::new(*range, EffectType::Unknown).covers(addr, size))
    }
}

/// One potential parameter observed at a call site or function body.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
pub struct ParamTrial {
    /// The observed storage.
    pub storage: VarnodeData,
    /// Whether data-flow confirmed the trial.
    pub confirmed: bool,
}

/// The set of parameter trials being collected for recovery.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default)]
pub struct ParamActive {
    trials: Vec<ParamTrial>,
    active: bool,
}

impl ParamActive {
    /// Returns a new inactive trial set.
    pub fn new() -> ParamActive {
        ParamActive::default()
    }

    /// Returns true iff trials are being collected.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Starts collecting trials.
    pub fn activate(&mut self) {
        self.active = true;
        self.trials.clear();
    }

    /// Stops collecting trials.
    pub fn deactivate(&mut self) {
        self.active = false;
    }

    /// Returns the index of the trial with the given storage, if registered.
    pub fn which_trial(&self, addr: &Address, size: u32) -> Option<usize> {
        self.trials
            .iter()
            .position(|trial| trial.storage.addr == *addr && trial.storage.size == size)
    }

    /// Registers a new trial for the given storage.
    pub fn register_trial(&mut self, addr: Address, size: u32) {
        self.trials.push(ParamTrial {
            storage: VarnodeData::new(addr, size),
            confirmed: false,
        });
    }

    /// Marks the trial with the given index as confirmed by data-flow.
    pub fn confirm(&mut self, index: usize) {
        self.trials[index].confirmed = true;
    }

    /// Returns the registered trials.
    pub fn trials(&self) -> &[ParamTrial] {
        &self.trials
    }
}

/// Everything known about one call site within the function being analyzed.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FuncCallSpecs {
    /// The CALL or CALLIND op.
    op: OpId,
    /// The name of the called function, if known.
    pub name: Option<String>,
    /// The entry address of the called function, for direct calls.
    pub entry: Option<Address>,
    /// The prototype of the called function.
    pub proto: FuncProto,
    /// Input parameter trials at this call site.
    pub active_input: ParamActive,
    /// Return value trials at this call site.
    pub active_output: ParamActive,
}

impl FuncCallSpecs {
    /// Returns new call specs for the given call op.
    pub fn new(op: OpId, proto: FuncProto) -> FuncCallSpecs {
        FuncCallSpecs {
            op,
            name: None,
            entry: None,
            proto,
            active_input: ParamActive::new(),
            active_output: ParamActive::new(),
        }
    }

    /// Returns the call op these specs describe.
    pub fn op(&self) -> OpId {
        self.op
    }

    /// Returns the effect of this call on the given storage range.
    pub fn effect_for(&self, addr: &Address, size: u32) -> EffectType {
        self.proto.effect_for(addr, size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::SpaceId;

    fn reg(offset: u64, size: u32) -> VarnodeData {
        VarnodeData::new(Address::new(SpaceId::mock_register(), offset), size)
    }

    /// A model resembling a simple register calling convention: r0 carries
    /// the return value and is killed, r4 is callee-saved.
    fn mock_model() -> ProtoModel {
        let mut model = ProtoModel::new("default");
        model.effects.push(EffectRecord::new(reg(0x0, 8), EffectType::KilledByCall));
        model.effects.push(EffectRecord::new(reg(0x20, 8), EffectType::Unaffected));
        model.input_ranges.push(reg(0x8, 24));
        model.output_ranges.push(reg(0x0, 8));
        model
    }

    #[test]
    fn effect_lookup() {
        let proto = FuncProto::new(mock_model());
        let r0 = Address::new(SpaceId::mock_register(), 0x0);
        let r4 = Address::new(SpaceId::mock_register(), 0x20);
        let r8 = Address::new(SpaceId::mock_register(), 0x40);
        assert_eq!(proto.effect_for(&r0, 8), EffectType::KilledByCall);
        // A sub-range of a record inherits its effect.
        assert_eq!(proto.effect_for(&r0.add_wrap(4), 4), EffectType::KilledByCall);
        assert_eq!(proto.effect_for(&r4, 8), EffectType::Unaffected);
        assert_eq!(proto.effect_for(&r8, 8), EffectType::Unknown);
    }

    #[test]
    fn parameter_ranges() {
        let proto = FuncProto::new(mock_model());
        let arg1 = Address::new(SpaceId::mock_register(), 0x8);
        assert!(proto.possible_input_param(&arg1, 8));
        assert!(proto.possible_output_param(&Address::new(SpaceId::mock_register(), 0x0), 8));
        assert!(!proto.possible_input_param(&Address::new(SpaceId::mock_register(), 0x40), 8));
    }

    #[test]
    fn trial_registration() {
        let mut active = ParamActive::new();
        active.activate();
        let addr = Address::new(SpaceId::mock_register(), 0x8);
        assert!(active.which_trial(&addr, 8).is_none());
        active.register_trial(addr, 8);
        let index = active.which_trial(&addr, 8).unwrap();
        active.confirm(index);
        assert!(active.trials()[index].confirmed);
    }
}
