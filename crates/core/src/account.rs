use alloy::{primitives::Address, signers::local::PrivateKeySigner};

/// A sending identity: one signing key and the address derived from it.
/// Passed explicitly into every call; nothing in the engine assumes a
/// single global sender, so any number of accounts may run at once.
#[derive(Clone, Debug)]
pub struct Account {
    signer: PrivateKeySigner,
    address: Address,
}

impl Account {
    pub fn new(signer: PrivateKeySigner) -> Self {
        let address = signer.address();
        Self { signer, address }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn signer(&self) -> &PrivateKeySigner {
        &self.signer
    }
}

impl From<PrivateKeySigner> for Account {
    fn from(signer: PrivateKeySigner) -> Self {
        Self::new(signer)
    }
}
