use crate::{state::State, value::ResolvedVarNode};

/// Anything with a symbolic entry and exit state.
pub trait ModelingContext<'ctx> {
    fn get_original_state(&self) -> Option<&State<'ctx>>;

    fn get_final_state(&self) -> Option<&State<'ctx>>;

    fn get_inputs(&self) -> Vec<&ResolvedVarNode<'ctx>>;

    fn get_outputs(&self) -> Vec<&ResolvedVarNode<'ctx>>;
}
