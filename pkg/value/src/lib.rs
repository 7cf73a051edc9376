mod scan;
mod value;

pub use scan::scan_number;
pub use value::{deep_equal, AbstractType, AbstractValue, Value};
