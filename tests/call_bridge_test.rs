//! Call bridge scenarios driven through in-memory dialogs and anchors

use async_trait::async_trait;
use sipbridge::application::{CallBridge, CallBridgeConfig};
use sipbridge::domain::call::{
    CallFailure, CallState, Dialog, DialogError, DialogFactory, InboundCall, InboundInvite,
    OutboundCall, OutboundEvent, OutboundInvite,
};
use sipbridge::domain::media::{AnchorError, AnchorHandle, AnchorKind, MediaAnchor};
use sipbridge::domain::registration::LocationRegistry;
use sipbridge::domain::shared::{Aor, CallId, Tag};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_test::{assert_err, assert_ok};

// ---------------------------------------------------------------------------
// Fakes

struct FakeDialog {
    id: String,
    ended: watch::Sender<bool>,
    destroy_calls: AtomicUsize,
}

impl FakeDialog {
    fn new(id: &str) -> Arc<Self> {
        let (ended, _) = watch::channel(false);
        Arc::new(Self {
            id: id.to_string(),
            ended,
            destroy_calls: AtomicUsize::new(0),
        })
    }

    /// The peer hung up
    fn remote_hangup(&self) {
        self.ended.send_replace(true);
    }

    fn destroy_calls(&self) -> usize {
        self.destroy_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialog for FakeDialog {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn destroy(&self) -> Result<(), DialogError> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        self.ended.send_replace(true);
        Ok(())
    }

    async fn destroyed(&self) {
        let mut rx = self.ended.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }

    fn is_destroyed(&self) -> bool {
        *self.ended.borrow()
    }
}

/// What the caller saw
struct InboundProbe {
    provisional: Mutex<Vec<u16>>,
    rejections: Mutex<Vec<(u16, String)>>,
    answers: Mutex<Vec<String>>,
    dialog: Arc<FakeDialog>,
    cancel: watch::Sender<bool>,
}

impl InboundProbe {
    fn new() -> Arc<Self> {
        let (cancel, _) = watch::channel(false);
        Arc::new(Self {
            provisional: Mutex::new(Vec::new()),
            rejections: Mutex::new(Vec::new()),
            answers: Mutex::new(Vec::new()),
            dialog: FakeDialog::new("inbound"),
            cancel,
        })
    }

    fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    fn final_responses(&self) -> usize {
        self.rejections.lock().unwrap().len() + self.answers.lock().unwrap().len()
    }

    fn rejection(&self) -> Option<(u16, String)> {
        self.rejections.lock().unwrap().first().cloned()
    }
}

struct FakeInbound {
    invite: InboundInvite,
    probe: Arc<InboundProbe>,
}

#[async_trait]
impl InboundCall for FakeInbound {
    fn invite(&self) -> &InboundInvite {
        &self.invite
    }

    async fn send_provisional(&self, status: u16, _reason: &str) -> Result<(), DialogError> {
        self.probe.provisional.lock().unwrap().push(status);
        Ok(())
    }

    async fn cancelled(&self) {
        let mut rx = self.probe.cancel.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    fn is_cancelled(&self) -> bool {
        *self.probe.cancel.borrow()
    }

    async fn answer(self: Box<Self>, sdp: String) -> Result<Arc<dyn Dialog>, DialogError> {
        self.probe.answers.lock().unwrap().push(sdp);
        Ok(self.probe.dialog.clone())
    }

    async fn reject(self: Box<Self>, status: u16, reason: String) -> Result<(), DialogError> {
        self.probe.rejections.lock().unwrap().push((status, reason));
        Ok(())
    }
}

/// What the callee side saw, and a handle to script its responses
#[derive(Default)]
struct OutboundProbe {
    invites: Mutex<Vec<OutboundInvite>>,
    events: Mutex<Option<mpsc::UnboundedSender<OutboundEvent>>>,
    cancels: AtomicUsize,
    fail_invite: AtomicBool,
}

impl OutboundProbe {
    fn push(&self, event: OutboundEvent) {
        let events = self.events.lock().unwrap();
        events.as_ref().expect("no outbound leg yet").send(event).unwrap();
    }

    fn has_leg(&self) -> bool {
        self.events.lock().unwrap().is_some()
    }

    fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

struct FakeOutbound {
    events: mpsc::UnboundedReceiver<OutboundEvent>,
    probe: Arc<OutboundProbe>,
}

#[async_trait]
impl OutboundCall for FakeOutbound {
    async fn next_event(&mut self) -> Option<OutboundEvent> {
        self.events.recv().await
    }

    async fn cancel(&mut self) -> Result<(), DialogError> {
        self.probe.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeFactory {
    probe: Arc<OutboundProbe>,
}

#[async_trait]
impl DialogFactory for FakeFactory {
    async fn invite(&self, request: OutboundInvite) -> Result<Box<dyn OutboundCall>, DialogError> {
        if self.probe.fail_invite.load(Ordering::SeqCst) {
            return Err(DialogError::Transport("unreachable".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.probe.invites.lock().unwrap().push(request);
        *self.probe.events.lock().unwrap() = Some(tx);
        Ok(Box::new(FakeOutbound {
            events: rx,
            probe: self.probe.clone(),
        }))
    }
}

#[derive(Default)]
struct FakeAnchor {
    offers: AtomicUsize,
    answers: AtomicUsize,
    bridges: AtomicUsize,
    releases: AtomicUsize,
    fail_offer: AtomicBool,
    fail_answer: AtomicBool,
    offer_delay: Mutex<Duration>,
    answer_delay: Mutex<Duration>,
}

impl FakeAnchor {
    fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn delay(delay: &Mutex<Duration>) -> Duration {
        *delay.lock().unwrap()
    }
}

#[async_trait]
impl MediaAnchor for FakeAnchor {
    fn kind(&self) -> AnchorKind {
        AnchorKind::RelayPassthrough
    }

    async fn prepare_offer(
        &self,
        _call_id: &CallId,
        _from_tag: &Tag,
        _remote_offer: &str,
    ) -> Result<(String, AnchorHandle), AnchorError> {
        tokio::time::sleep(Self::delay(&self.offer_delay)).await;
        if self.fail_offer.load(Ordering::SeqCst) {
            return Err(AnchorError::Relay("relay down".to_string()));
        }
        self.offers.fetch_add(1, Ordering::SeqCst);
        Ok(("anchored-offer".to_string(), AnchorHandle::new(self.kind())))
    }

    async fn prepare_answer(
        &self,
        _handle: &AnchorHandle,
        _to_tag: &Tag,
        _remote_answer: &str,
    ) -> Result<String, AnchorError> {
        tokio::time::sleep(Self::delay(&self.answer_delay)).await;
        if self.fail_answer.load(Ordering::SeqCst) {
            return Err(AnchorError::Relay("relay refused answer".to_string()));
        }
        self.answers.fetch_add(1, Ordering::SeqCst);
        Ok("anchored-answer".to_string())
    }

    async fn bridge(&self, _handle: &AnchorHandle) -> Result<(), AnchorError> {
        self.bridges.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn release(&self, _handle: &AnchorHandle) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Harness

struct Harness {
    bridge: Arc<CallBridge>,
    registry: LocationRegistry,
    anchor: Arc<FakeAnchor>,
    outbound: Arc<OutboundProbe>,
}

impl Harness {
    async fn new(config: CallBridgeConfig) -> Self {
        let registry = LocationRegistry::new();
        registry
            .upsert(Aor::new("bob").unwrap(), "sip:bob@10.0.0.2:5060", 3600)
            .await
            .unwrap();

        let anchor = Arc::new(FakeAnchor::default());
        let outbound = Arc::new(OutboundProbe::default());
        let bridge = Arc::new(CallBridge::new(
            registry.clone(),
            anchor.clone(),
            Arc::new(FakeFactory {
                probe: outbound.clone(),
            }),
            config,
        ));

        Self {
            bridge,
            registry,
            anchor,
            outbound,
        }
    }

    async fn with_defaults() -> Self {
        Self::new(CallBridgeConfig::default()).await
    }

    /// Start an INVITE from alice to `user` on its own task
    fn call(&self, call_id: &str, user: &str) -> (Arc<InboundProbe>, tokio::task::JoinHandle<Result<(), CallFailure>>) {
        self.call_uri(call_id, &format!("sip:{}@example.com", user))
    }

    fn call_uri(
        &self,
        call_id: &str,
        request_uri: &str,
    ) -> (Arc<InboundProbe>, tokio::task::JoinHandle<Result<(), CallFailure>>) {
        let probe = InboundProbe::new();
        let inbound = FakeInbound {
            invite: InboundInvite {
                call_id: CallId::new(call_id),
                from_tag: Tag::new("alice-tag"),
                from_uri: "sip:alice@example.com".to_string(),
                request_uri: request_uri.to_string(),
                offer_sdp: "caller-offer".to_string(),
            },
            probe: probe.clone(),
        };

        let bridge = self.bridge.clone();
        let task = tokio::spawn(async move { bridge.handle_invite(Box::new(inbound)).await });
        (probe, task)
    }

    fn answered(&self, dialog: &Arc<FakeDialog>) {
        self.outbound.push(OutboundEvent::Answered {
            dialog: dialog.clone(),
            to_tag: Tag::new("bob-tag"),
            answer_sdp: "callee-answer".to_string(),
        });
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn wait_for_leg(h: &Harness) {
    let outbound = h.outbound.clone();
    eventually("outbound leg", move || outbound.has_leg()).await;
}

async fn bridged_call(h: &Harness, call_id: &str) -> (Arc<InboundProbe>, Arc<FakeDialog>) {
    let (caller, task) = h.call(call_id, "bob");
    wait_for_leg(h).await;

    let callee = FakeDialog::new("outbound");
    h.outbound.push(OutboundEvent::Provisional {
        status: 180,
        reason: "Ringing".to_string(),
    });
    h.answered(&callee);

    assert_ok!(task.await.unwrap());
    (caller, callee)
}

// ---------------------------------------------------------------------------
// Scenarios

#[tokio::test]
async fn test_successful_call_is_bridged_once() {
    let h = Harness::with_defaults().await;
    let (caller, _callee) = bridged_call(&h, "call-ok").await;

    assert_eq!(*caller.answers.lock().unwrap(), vec!["anchored-answer".to_string()]);
    assert_eq!(caller.final_responses(), 1);
    assert_eq!(*caller.provisional.lock().unwrap(), vec![180]);
    assert_eq!(FakeAnchor::count(&h.anchor.bridges), 1);
    assert_eq!(FakeAnchor::count(&h.anchor.releases), 0);

    let invites = h.outbound.invites.lock().unwrap();
    assert_eq!(invites.len(), 1);
    assert_eq!(invites[0].target, "sip:bob@10.0.0.2:5060");
    assert_eq!(invites[0].offer_sdp, "anchored-offer");

    assert_eq!(h.bridge.active_call_count().await, 1);
    assert_eq!(h.bridge.call_state(&CallId::new("call-ok")).await, Some(CallState::Bridged));
}

#[tokio::test]
async fn test_unregistered_destination_creates_no_media() {
    let h = Harness::with_defaults().await;
    let (caller, task) = h.call("call-nobody", "carol");

    let failure = assert_err!(task.await.unwrap());
    assert!(matches!(failure, CallFailure::DestinationUnreachable(_)));
    assert_eq!(caller.rejection(), Some((486, "Busy Here".to_string())));
    assert_eq!(caller.final_responses(), 1);
    assert_eq!(FakeAnchor::count(&h.anchor.offers), 0);
    assert!(!h.outbound.has_leg());
    assert_eq!(h.bridge.active_call_count().await, 0);
}

#[tokio::test]
async fn test_request_uri_without_user_is_not_found() {
    let h = Harness::with_defaults().await;
    let (caller, task) = h.call_uri("call-hostonly", "sip:example.com");

    let failure = assert_err!(task.await.unwrap());
    assert!(matches!(failure, CallFailure::InvalidDestination(_)));
    assert_eq!(caller.rejection().map(|(status, _)| status), Some(404));
    assert_eq!(FakeAnchor::count(&h.anchor.offers), 0);
    assert!(!h.outbound.has_leg());
}

#[tokio::test]
async fn test_unregister_makes_destination_unreachable() {
    let h = Harness::with_defaults().await;
    h.registry.upsert(Aor::new("bob").unwrap(), "*", 0).await.unwrap();

    let (caller, task) = h.call("call-gone", "bob");
    assert_err!(task.await.unwrap());
    assert_eq!(caller.rejection().map(|(status, _)| status), Some(486));
}

#[tokio::test]
async fn test_remote_rejection_is_forwarded_verbatim() {
    let h = Harness::with_defaults().await;
    let (caller, task) = h.call("call-busy", "bob");
    wait_for_leg(&h).await;

    h.outbound.push(OutboundEvent::Provisional {
        status: 180,
        reason: "Ringing".to_string(),
    });
    h.outbound.push(OutboundEvent::Rejected {
        status: 486,
        reason: "Gone Fishing".to_string(),
    });

    let failure = assert_err!(task.await.unwrap());
    assert_eq!(
        failure,
        CallFailure::RemoteRejected {
            status: 486,
            reason: "Gone Fishing".to_string()
        }
    );
    assert_eq!(caller.rejection(), Some((486, "Gone Fishing".to_string())));
    assert_eq!(caller.final_responses(), 1);
    assert_eq!(FakeAnchor::count(&h.anchor.releases), 1);
    assert_eq!(FakeAnchor::count(&h.anchor.bridges), 0);
}

#[tokio::test]
async fn test_caller_cancel_while_ringing() {
    let h = Harness::with_defaults().await;
    let (caller, task) = h.call("call-cancel", "bob");
    wait_for_leg(&h).await;

    caller.cancel();

    let failure = assert_err!(task.await.unwrap());
    assert_eq!(failure, CallFailure::Cancelled);
    assert_eq!(h.outbound.cancels(), 1);
    assert_eq!(FakeAnchor::count(&h.anchor.releases), 1);
    assert_eq!(caller.rejection(), Some((487, "Request Terminated".to_string())));
    assert!(caller.answers.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_caller_cancel_while_anchoring_never_rings_callee() {
    let h = Harness::with_defaults().await;
    *h.anchor.offer_delay.lock().unwrap() = Duration::from_millis(100);

    let (caller, task) = h.call("call-cancel-anchor", "bob");
    tokio::time::sleep(Duration::from_millis(10)).await;
    caller.cancel();

    let failure = assert_err!(task.await.unwrap());
    assert_eq!(failure, CallFailure::Cancelled);
    assert!(!h.outbound.has_leg());
    assert_eq!(h.outbound.cancels(), 0);
    assert!(caller.provisional.lock().unwrap().is_empty());
    assert_eq!(caller.rejection(), Some((487, "Request Terminated".to_string())));
    assert_eq!(caller.final_responses(), 1);
    // The session opened by the finished offer is still released
    assert_eq!(FakeAnchor::count(&h.anchor.offers), 1);
    assert_eq!(FakeAnchor::count(&h.anchor.releases), 1);
    assert_eq!(h.bridge.active_call_count().await, 0);
}

#[tokio::test]
async fn test_caller_cancel_while_answering_hangs_up_callee() {
    let h = Harness::with_defaults().await;
    *h.anchor.answer_delay.lock().unwrap() = Duration::from_millis(200);

    let (caller, task) = h.call("call-cancel-answer", "bob");
    wait_for_leg(&h).await;
    let callee = FakeDialog::new("outbound");
    h.answered(&callee);

    let state_of = h.bridge.clone();
    let mut answering = false;
    for _ in 0..40 {
        if state_of.call_state(&CallId::new("call-cancel-answer")).await == Some(CallState::Answering) {
            answering = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(answering);
    caller.cancel();

    let failure = assert_err!(task.await.unwrap());
    assert_eq!(failure, CallFailure::Cancelled);
    assert_eq!(caller.rejection(), Some((487, "Request Terminated".to_string())));
    assert!(caller.answers.lock().unwrap().is_empty());
    assert_eq!(callee.destroy_calls(), 1);
    assert_eq!(FakeAnchor::count(&h.anchor.bridges), 0);
    assert_eq!(FakeAnchor::count(&h.anchor.releases), 1);
}

#[tokio::test]
async fn test_late_answer_after_cancel_is_hung_up() {
    let h = Harness::with_defaults().await;
    let (caller, task) = h.call("call-late", "bob");
    wait_for_leg(&h).await;

    caller.cancel();
    assert_err!(task.await.unwrap());

    // 200 OK crossed our CANCEL on the wire
    let late = FakeDialog::new("late");
    h.answered(&late);

    let probe = late.clone();
    eventually("late dialog hangup", move || probe.destroy_calls() == 1).await;
    assert!(caller.answers.lock().unwrap().is_empty());
    assert_eq!(FakeAnchor::count(&h.anchor.releases), 1);
}

#[tokio::test]
async fn test_ring_timeout_cancels_outbound_leg() {
    let h = Harness::new(CallBridgeConfig {
        ring_timeout: Duration::from_millis(100),
        late_answer_grace: Duration::from_millis(100),
    })
    .await;

    let (caller, task) = h.call("call-timeout", "bob");
    let failure = assert_err!(task.await.unwrap());

    assert!(matches!(failure, CallFailure::RemoteTimeout(_)));
    assert_eq!(h.outbound.cancels(), 1);
    assert_eq!(caller.rejection(), Some((408, "Request Timeout".to_string())));
    assert_eq!(FakeAnchor::count(&h.anchor.releases), 1);
}

#[tokio::test]
async fn test_anchor_offer_failure() {
    let h = Harness::with_defaults().await;
    h.anchor.fail_offer.store(true, Ordering::SeqCst);

    let (caller, task) = h.call("call-noanchor", "bob");
    let failure = assert_err!(task.await.unwrap());

    assert!(matches!(failure, CallFailure::AnchorUnavailable(_)));
    assert_eq!(caller.rejection().map(|(status, _)| status), Some(500));
    assert!(!h.outbound.has_leg());
    assert_eq!(FakeAnchor::count(&h.anchor.releases), 0);
}

#[tokio::test]
async fn test_outbound_invite_failure_releases_anchor() {
    let h = Harness::with_defaults().await;
    h.outbound.fail_invite.store(true, Ordering::SeqCst);

    let (caller, task) = h.call("call-noroute", "bob");
    let failure = assert_err!(task.await.unwrap());

    assert!(matches!(failure, CallFailure::Transport(_)));
    assert_eq!(caller.rejection().map(|(status, _)| status), Some(500));
    assert_eq!(FakeAnchor::count(&h.anchor.releases), 1);
}

#[tokio::test]
async fn test_answer_anchor_failure_hangs_up_callee() {
    let h = Harness::with_defaults().await;
    h.anchor.fail_answer.store(true, Ordering::SeqCst);

    let (caller, task) = h.call("call-badanswer", "bob");
    wait_for_leg(&h).await;
    let callee = FakeDialog::new("outbound");
    h.answered(&callee);

    let failure = assert_err!(task.await.unwrap());
    assert!(matches!(failure, CallFailure::AnchorUnavailable(_)));
    assert_eq!(callee.destroy_calls(), 1);
    assert_eq!(caller.rejection().map(|(status, _)| status), Some(500));
    assert_eq!(FakeAnchor::count(&h.anchor.releases), 1);
}

#[tokio::test]
async fn test_callee_hangup_tears_down_caller() {
    let h = Harness::with_defaults().await;
    let (caller, callee) = bridged_call(&h, "call-bye").await;

    callee.remote_hangup();

    let anchor = h.anchor.clone();
    eventually("release", move || FakeAnchor::count(&anchor.releases) == 1).await;
    assert_eq!(caller.dialog.destroy_calls(), 1);
    assert_eq!(callee.destroy_calls(), 0);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(FakeAnchor::count(&h.anchor.releases), 1);
    assert_eq!(h.bridge.active_call_count().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_hangups_release_once() {
    let h = Harness::with_defaults().await;
    let (caller, callee) = bridged_call(&h, "call-race").await;

    let start = Arc::new(tokio::sync::Barrier::new(2));
    let hangups = [caller.dialog.clone(), callee.clone()].map(|dialog| {
        let start = start.clone();
        tokio::spawn(async move {
            start.wait().await;
            dialog.remote_hangup();
        })
    });
    for hangup in hangups {
        hangup.await.unwrap();
    }

    let anchor = h.anchor.clone();
    eventually("release", move || FakeAnchor::count(&anchor.releases) >= 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(FakeAnchor::count(&h.anchor.releases), 1);
    assert_eq!(h.bridge.active_call_count().await, 0);
}

#[tokio::test]
async fn test_local_hangup_and_shutdown() {
    let h = Harness::with_defaults().await;
    let (caller, callee) = bridged_call(&h, "call-local").await;

    assert!(h.bridge.hangup(&CallId::new("call-local")).await);
    assert!(!h.bridge.hangup(&CallId::new("call-local")).await);

    assert_eq!(caller.dialog.destroy_calls(), 1);
    assert_eq!(callee.destroy_calls(), 1);
    assert_eq!(FakeAnchor::count(&h.anchor.releases), 1);

    h.bridge.shutdown().await;
    assert_eq!(h.bridge.active_call_count().await, 0);
}
