mod math;

pub use math::{AbsIntrinsic, MaxIntrinsic, MinIntrinsic, ReluIntrinsic};
