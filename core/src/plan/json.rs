use std::collections::BTreeMap;

use serde::Serialize;

use super::Executable;
use crate::internal::*;
use crate::memory::{DynamicStats, MemClass, VarMemState};

#[derive(Serialize)]
struct OprDump {
    step: usize,
    uid: usize,
    name: String,
    op: String,
    info: Vec<String>,
    comp_node: CompNode,
    inputs: Vec<usize>,
    outputs: Vec<usize>,
}

#[derive(Serialize)]
struct VarDump<'a> {
    uid: usize,
    name: &'a str,
    datum_type: String,
    shape: Option<Vec<usize>>,
    format: TensorFormat,
    comp_node: CompNode,
    mem_class: Option<MemClass>,
    mem_state: VarMemState,
    static_offset: Option<usize>,
    receiver: &'a VarReceiverInfo,
}

#[derive(Serialize)]
struct ExecutableDump<'a> {
    part: usize,
    oprs: Vec<OprDump>,
    vars: Vec<VarDump<'a>>,
    static_memory: BTreeMap<String, usize>,
    dynamic: DynamicStats,
}

impl Executable {
    /// Operators, variables and memory plan, for inspection.
    pub fn to_json(&self) -> GraftResult<serde_json::Value> {
        let oprs = self
            .iter_oprs_seq()
            .enumerate()
            .map(|(step, opr)| {
                Ok(OprDump {
                    step,
                    uid: opr.uid,
                    name: opr.name.clone(),
                    op: opr.op().name().into_owned(),
                    info: opr.op().info()?,
                    comp_node: opr.comp_node,
                    inputs: opr.inputs.iter().map(|v| v.index()).collect(),
                    outputs: opr.outputs.iter().map(|v| v.index()).collect(),
                })
            })
            .collect::<GraftResult<Vec<_>>>()?;
        let vars = self
            .vars_sorted()
            .map(|(id, plan)| VarDump {
                uid: id.index(),
                name: &plan.name,
                datum_type: format!("{:?}", plan.fact.datum_type),
                shape: plan.fact.shape.as_ref().map(|s| s.to_vec()),
                format: plan.fact.format,
                comp_node: plan.comp_node,
                mem_class: plan.class,
                mem_state: self.mem_state(*id),
                static_offset: self.static_offset(*id),
                receiver: &plan.receiver,
            })
            .collect();
        let static_memory = self.schemas.iter().map(|(cn, s)| (cn.to_string(), s.memory_size())).collect();
        let dump = ExecutableDump { part: self.part(), oprs, vars, static_memory, dynamic: self.stats() };
        Ok(serde_json::to_value(dump)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_lists_sequence_and_memory() -> GraftResult<()> {
        let mut graph = ComputingGraph::make();
        graph.options_mut().graph_opt_level = 0;
        let x = graph.host_input("x", &HostTensor::new(tensor1(&[1.0, 2.0])))?;
        let y = graph.relu(x)?;
        let (spec, _) = callback_copy(y);
        let mut exe = graph.compile(vec![spec])?;
        exe.execute()?;
        exe.wait()?;
        let json = exe.to_json()?;
        let oprs = json["oprs"].as_array().context("oprs")?;
        assert_eq!(oprs.len(), 3);
        assert_eq!(oprs[0]["op"], "HostInput");
        let vars = json["vars"].as_array().context("vars")?;
        assert!(vars.iter().all(|v| v["mem_class"] == "Static"));
        assert!(vars.iter().all(|v| v["mem_state"] == "StaticBound"));
        assert!(json["static_memory"]["cpu0"].as_u64().is_some());
        Ok(())
    }
}
