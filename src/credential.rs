use feed::Credential;
use tokio::sync::watch;

/// Generation counter bumped on every login/logout.
///
/// Anything scheduled under one epoch (a reconnect, an HTTP response) is only
/// honored while the holder still reports that same epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Epoch(pub u64);

impl std::fmt::Display for Epoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "e{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Versioned {
    pub epoch: Epoch,
    pub credential: Option<Credential>,
}

impl Versioned {
    pub fn is_current(&self, epoch: Epoch) -> bool {
        self.epoch == epoch && self.credential.is_some()
    }
}

/// The single owner of the bearer token. Consumers subscribe and react; none of
/// them can change it.
#[derive(Debug)]
pub struct CredentialHolder {
    sender: watch::Sender<Versioned>,
}

impl CredentialHolder {
    pub fn new(initial: Option<Credential>) -> Self {
        let (sender, _) = watch::channel(Versioned {
            epoch: Epoch(u64::from(initial.is_some())),
            credential: initial,
        });
        Self { sender }
    }

    pub fn login(&self, credential: Credential) {
        self.replace(Some(credential));
    }

    pub fn logout(&self) {
        self.replace(None);
    }

    pub fn subscribe(&self) -> watch::Receiver<Versioned> {
        self.sender.subscribe()
    }

    fn replace(&self, credential: Option<Credential>) {
        self.sender.send_if_modified(|current| {
            if current.credential == credential {
                return false;
            }
            current.epoch = Epoch(current.epoch.0 + 1);
            current.credential = credential;
            log::info!(
                "credential {} ({})",
                if current.credential.is_some() {
                    "set"
                } else {
                    "cleared"
                },
                current.epoch
            );
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn current(holder: &CredentialHolder) -> Versioned {
        holder.subscribe().borrow().clone()
    }

    #[test]
    fn every_identity_change_bumps_epoch() {
        let holder = CredentialHolder::new(None);
        assert_eq!(current(&holder).epoch, Epoch(0));

        holder.login(Credential::new("a"));
        let first = current(&holder);
        assert!(first.is_current(Epoch(1)));

        holder.login(Credential::new("a"));
        assert_eq!(current(&holder).epoch, Epoch(1));

        holder.login(Credential::new("b"));
        assert_eq!(current(&holder).epoch, Epoch(2));

        holder.logout();
        let cleared = current(&holder);
        assert_eq!(cleared.epoch, Epoch(3));
        assert!(!cleared.is_current(Epoch(3)));
    }

    #[tokio::test]
    async fn subscribers_see_changes() {
        let holder = CredentialHolder::new(Some(Credential::new("a")));
        let mut rx = holder.subscribe();

        holder.logout();
        rx.changed().await.unwrap();

        assert!(rx.borrow_and_update().credential.is_none());
    }
}
