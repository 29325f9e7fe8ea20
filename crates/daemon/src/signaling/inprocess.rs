//! Process-global broker (`inprocess:`), for tests and single-host meshes.

use parking_lot::Mutex;
use std::sync::{Arc, LazyLock, Weak};

use super::backend::SubscriptionsRegistry;
use super::envelope::Envelope;
use crate::error::SignalingError;

static REGISTRIES: LazyLock<Mutex<Vec<Weak<SubscriptionsRegistry>>>> =
    LazyLock::new(|| Mutex::new(Vec::new()));

pub struct InProcessBackend {
    registry: Arc<SubscriptionsRegistry>,
}

impl InProcessBackend {
    pub fn new(registry: Arc<SubscriptionsRegistry>) -> Self {
        REGISTRIES.lock().push(Arc::downgrade(&registry));
        Self { registry }
    }

    pub async fn publish(&self, env: &Envelope) -> Result<(), SignalingError> {
        let registries: Vec<Arc<SubscriptionsRegistry>> = {
            let mut all = REGISTRIES.lock();
            all.retain(|w| w.strong_count() > 0);
            all.iter().filter_map(Weak::upgrade).collect()
        };

        for r in registries {
            r.dispatch(env).await;
        }
        Ok(())
    }

    pub fn close(&self) {
        let me = Arc::downgrade(&self.registry);
        REGISTRIES.lock().retain(|w| !w.ptr_eq(&me) && w.strong_count() > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Key, KeyPair};
    use crate::signaling::envelope::{Change, Message, PeerDescription};
    use std::collections::BTreeMap;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_delivers_across_registries() {
        let ra = Arc::new(SubscriptionsRegistry::new());
        let rb = Arc::new(SubscriptionsRegistry::new());
        let a = InProcessBackend::new(Arc::clone(&ra));
        let b = InProcessBackend::new(Arc::clone(&rb));

        let ka = Key::generate_private();
        let kb = Key::generate_private();
        let (tx, mut rx) = mpsc::channel(4);
        rb.subscribe(KeyPair::new(kb, ka.public_key()), tx);

        let msg = Message::peer(PeerDescription {
            change: Change::Remove,
            name: String::new(),
            public_key: ka.public_key(),
            public_key_new: None,
            allowed_ips: Vec::new(),
            build_info: String::new(),
            hosts: BTreeMap::new(),
        });
        let env = Envelope::seal(&KeyPair::new(ka, kb.public_key()), &msg).unwrap();
        a.publish(&env).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().message, msg);

        b.close();
        a.publish(&env).await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
