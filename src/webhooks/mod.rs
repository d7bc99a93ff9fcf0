/// Inbound payment-processor webhooks: signature checks and payload parsing
pub mod events;
pub mod signatures;

pub use events::{SquareAction, SquareEvent, StripeAction, StripeEvent};
pub use signatures::{
    verify_square_signature, verify_stripe_signature, SQUARE_SIGNATURE_HEADER,
    STRIPE_SIGNATURE_HEADER,
};
