pub mod meeting;
pub mod notification;
pub mod payment;
pub mod quote;

pub use meeting::Entity as Meeting;
pub use notification::Entity as Notification;
pub use payment::Entity as Payment;
pub use quote::Entity as Quote;
