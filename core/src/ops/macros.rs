#[macro_export]
macro_rules! impl_op_same_as {
    () => {
        fn same_as(&self, other: &dyn $crate::ops::Op) -> bool {
            if let Some(other) = other.downcast_ref::<Self>() { self == other } else { false }
        }
    };
}

#[macro_export]
macro_rules! args_1 {
    ($inputs:expr) => {{
        let mut inputs = $inputs;
        if inputs.len() != 1 {
            $crate::internal::bail!("Expected 1 arg, got {:?}", inputs)
        }
        let result = inputs.pop().unwrap();
        ::std::mem::drop(inputs);
        result
    }};
}

#[macro_export]
macro_rules! args_2 {
    ($inputs:expr) => {{
        let mut inputs = $inputs;
        if inputs.len() != 2 {
            $crate::internal::bail!("Expected 2 arg, got {:?}", inputs)
        }
        inputs.swap(0, 1);
        let result = (inputs.pop().unwrap(), inputs.pop().unwrap());
        ::std::mem::drop(inputs);
        result
    }};
}

#[macro_export]
macro_rules! args_3 {
    ($inputs:expr) => {{
        let mut inputs = $inputs;
        if inputs.len() != 3 {
            $crate::internal::bail!("Expected 3 arg, got {:?}", inputs)
        }
        inputs.reverse();
        let result = (inputs.pop().unwrap(), inputs.pop().unwrap(), inputs.pop().unwrap());
        ::std::mem::drop(inputs);
        result
    }};
}
