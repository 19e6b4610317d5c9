// Domain-layer modules and shared errors/models
pub mod analytics {
    pub use crate::analytics::*;
}

pub mod currency {
    pub use crate::currency::*;
}

pub mod forecast {
    pub use crate::forecast::*;
}

pub mod models {
    pub use crate::models::*;
}

pub mod payment_calculator {
    pub use crate::payment_calculator::*;
}

pub mod payment_triggers {
    pub use crate::payment_triggers::*;
}

pub mod services {
    pub use crate::services::*;
}

pub mod errors {
    pub use crate::errors::*;
}
