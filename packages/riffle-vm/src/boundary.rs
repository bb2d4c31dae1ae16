//! Classification of yielded values at the host boundary.
//!
//! The boundary inspects what a coroutine yielded while it still holds host
//! access, and hands the engine a [`Yielded`] it can interpret without ever
//! touching raw host objects again.

use crate::do_ctrl::{DoCtrl, DoExpr};
use crate::effect::Effect;
use crate::host::HostValue;
use crate::program::ProgramFactory;

/// A classified coroutine yield.
#[derive(Debug, Clone)]
pub enum Yielded {
    Ctrl(DoCtrl),
    Effect(Effect),
    Program(ProgramFactory),
    Unknown(HostValue),
}

/// Classify a yielded expression.
///
/// The order is normative: control primitive, then effect object, then
/// kleisli-program call (already lowered to `DoCtrl::Call` at construction
/// time, so it lands in the first arm), then a bare legacy program, then
/// anything else, which surfaces as a type error. Reordering would dispatch
/// control primitives as effects.
pub fn classify(expr: DoExpr) -> Yielded {
    match expr {
        DoExpr::Ctrl(ctrl) => Yielded::Ctrl(ctrl),
        DoExpr::Effect(effect) => Yielded::Effect(effect),
        DoExpr::Program(factory) => Yielded::Program(factory),
        DoExpr::Opaque(host) => Yielded::Unknown(host),
    }
}

impl Yielded {
    pub fn kind(&self) -> &'static str {
        match self {
            Yielded::Ctrl(c) => c.kind(),
            Yielded::Effect(_) => "Effect",
            Yielded::Program(_) => "Program",
            Yielded::Unknown(_) => "Unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn test_classify_ctrl_before_effect() {
        // A Perform node wraps an effect but must classify as a control
        // primitive, not as the effect itself.
        let yielded = classify(DoExpr::Ctrl(DoCtrl::Perform {
            effect: Effect::get("x"),
        }));
        assert!(matches!(yielded, Yielded::Ctrl(DoCtrl::Perform { .. })));
    }

    #[test]
    fn test_classify_effect() {
        let yielded = classify(DoExpr::Effect(Effect::tell(Value::Int(1))));
        assert!(matches!(yielded, Yielded::Effect(Effect::Tell { .. })));
    }

    #[test]
    fn test_classify_bare_program() {
        use crate::program::{GenCoroutine, GenStep, Next};
        let factory = ProgramFactory::new("p", || {
            GenCoroutine::boxed(Next::new(|_| GenStep::done(Value::Unit)))
        });
        let yielded = classify(DoExpr::Program(factory));
        assert!(matches!(yielded, Yielded::Program(_)));
    }

    #[test]
    fn test_classify_unknown_host_object() {
        let yielded = classify(DoExpr::Opaque(HostValue::new("mystery", 3.14f64)));
        assert!(matches!(yielded, Yielded::Unknown(_)));
        assert_eq!(yielded.kind(), "Unknown");
    }
}
