// 🛡️ Everything that touches the OS lives here; modes only see the traits.

pub mod traits;     // Collaborator contracts
pub mod secrets;    // Memory hygiene (ProviderCredential) + secret stores
pub mod invoker;    // Delegated process execution
pub mod tunnel;     // Scoped ssh forwarding

#[cfg(test)]
pub mod testing;    // Recording fakes
