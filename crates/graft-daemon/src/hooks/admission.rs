//! Pre-receive admission state machine.
//!
//! [`evaluate`] is a pure function over a session snapshot, the parsed
//! ref-update lines, the push options, and injected collaborators; no
//! socket or daemon handle appears in its signature, so the whole state
//! machine runs in tests against in-memory fakes.
//!
//! The machine has three states. In `start` the direct-access bypass and
//! the federated-identity pre-check run; neither inspects a ref line. In
//! the per-line loop every line is evaluated strictly in the order
//! received, each producing a [`LineDecision`]. The final state is the
//! overall verdict: accept only if every line was accepted. Per-line
//! rejections are business outcomes, not errors; [`AdmissionError`] is
//! reserved for infrastructure failures that abort the whole evaluation.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use graft_core::models::{ContributionPolicy, UserKind};
use graft_core::objd::{Client, ObjdError, Oid, StatusError};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt as _};
use tracing::{info, warn};

use crate::ansi;
use crate::fedauth::{FedAuthError, FederationVerifier};
use crate::notify::Notifier;
use crate::session::PushSession;
use crate::store::{RecordStore, StoreError};
use crate::urls;

/// Ref namespace contribution branches must live under.
pub const CONTRIB_PREFIX: &str = "refs/heads/contrib/";

/// Errors that abort the whole evaluation.
///
/// These are infrastructure failures, distinct from per-line rejections;
/// the caller reports them to the pusher and fails the push.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// A ref-update line did not have the `<old> <new> <ref>` shape.
    #[error("invalid ref-update line: {line:?}")]
    InvalidLine {
        /// The offending line.
        line: String,
    },

    /// A `fedid=` push option did not have the `<service>:<username>`
    /// shape.
    #[error("invalid federated identity {claim:?}: missing colon")]
    InvalidFedClaim {
        /// The claim as supplied.
        claim: String,
    },

    /// The record store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The ancestry oracle failed.
    #[error(transparent)]
    Ancestry(#[from] AncestryError),

    /// The federation check failed to run (as opposed to returning a
    /// clean "not on the list").
    #[error("federation check: {0}")]
    Federation(#[from] FedAuthError),

    /// The pusher feedback stream failed.
    #[error("feedback stream: {0}")]
    Feedback(#[from] std::io::Error),
}

/// The ancestry oracle failed; wraps the underlying daemon error.
#[derive(Debug, Error)]
#[error("ancestry check failed: {0}")]
pub struct AncestryError(#[from] pub ObjdError);

/// Answers whether one commit is an ancestor of another.
#[async_trait]
pub trait AncestryProvider: Send + Sync {
    /// Returns whether `old` is an ancestor of `new` in `repo`.
    ///
    /// Commits with no common history are a clean `false`, not an error.
    ///
    /// # Errors
    ///
    /// Returns [`AncestryError`] when the oracle itself fails.
    async fn is_ancestor(&self, repo: &Path, old: &Oid, new: &Oid) -> Result<bool, AncestryError>;
}

/// Ancestry oracle backed by the object daemon's merge-base opcode.
///
/// `old` is an ancestor of `new` exactly when their merge base is `old`
/// itself. Each check opens its own connection, keeping the one-caller-
/// per-connection discipline.
pub struct ObjdAncestry {
    socket: PathBuf,
}

impl ObjdAncestry {
    /// Creates an oracle connecting to the object daemon at `socket`.
    #[must_use]
    pub fn new(socket: PathBuf) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl AncestryProvider for ObjdAncestry {
    async fn is_ancestor(&self, repo: &Path, old: &Oid, new: &Oid) -> Result<bool, AncestryError> {
        let mut client = Client::connect(&self.socket).await?;
        match client.merge_base(repo, old, new).await {
            Ok(base) => Ok(base == *old),
            Err(ObjdError::Status(StatusError::NoMergeBase)) => Ok(false),
            Err(e) => Err(AncestryError(e)),
        }
    }
}

/// One `<old-id> <new-id> <ref-name>` line from the hook's stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefLine {
    /// The ref's current tip; all-zero for a new ref.
    pub old: Oid,
    /// The proposed new tip.
    pub new: Oid,
    /// Full ref name.
    pub ref_name: String,
}

impl RefLine {
    /// Parses one ref-update line.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::InvalidLine`] when the line does not
    /// split into two 40-hex ids and a ref name.
    pub fn parse(line: &str) -> Result<Self, AdmissionError> {
        let invalid = || AdmissionError::InvalidLine {
            line: line.to_owned(),
        };
        let (old, rest) = line.split_once(' ').ok_or_else(invalid)?;
        let (new, ref_name) = rest.split_once(' ').ok_or_else(invalid)?;
        if ref_name.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            old: old.parse().map_err(|_| invalid())?,
            new: new.parse().map_err(|_| invalid())?,
            ref_name: ref_name.to_owned(),
        })
    }

    /// Parses the hook's entire stdin payload into ref-update lines.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::InvalidLine`] on the first malformed
    /// line.
    pub fn parse_all(stdin: &[u8]) -> Result<Vec<Self>, AdmissionError> {
        String::from_utf8_lossy(stdin)
            .lines()
            .filter(|line| !line.is_empty())
            .map(Self::parse)
            .collect()
    }

    /// The source ref relative to `refs/heads/`, e.g. `contrib/foo`.
    #[must_use]
    pub fn source_ref(&self) -> &str {
        self.ref_name
            .strip_prefix("refs/heads/")
            .unwrap_or(&self.ref_name)
    }
}

/// Why a single ref-update line was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The ref is outside `refs/heads/contrib/`.
    OutsideContrib,
    /// No merge request tracks this existing contrib branch.
    MissingMergeRequest,
    /// The tracking merge request was created anonymously.
    UnownedMergeRequest,
    /// The tracking merge request belongs to a different user.
    ForeignMergeRequest,
    /// The old tip is not an ancestor of the new tip.
    NonFastForward,
}

impl RejectReason {
    /// The parenthesized explanation shown next to a NAK.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OutsideContrib => "you cannot push to branches outside of contrib/*",
            Self::MissingMergeRequest => "no merge request tracks this contrib branch",
            Self::UnownedMergeRequest => "branch belongs to an unowned merge request",
            Self::ForeignMergeRequest => "branch belongs to another user's merge request",
            Self::NonFastForward => "force pushes are not supported",
        }
    }
}

/// What happened to one ref-update line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    /// The line passed its checks.
    Accepted,
    /// The line created a merge request.
    MergeRequestCreated {
        /// Per-repository merge request number.
        local_id: u64,
        /// Web URL reported to the pusher.
        url: String,
    },
    /// The line failed; the overall push will be rejected.
    Rejected(RejectReason),
}

impl LineOutcome {
    /// Whether this line counts toward an overall accept.
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

/// One line together with its decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineDecision {
    /// The evaluated line.
    pub line: RefLine,
    /// Its outcome.
    pub outcome: LineOutcome,
}

/// The state machine's final verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionOutcome {
    /// Per-line decisions, in the order the lines were received. Empty
    /// when the direct-access bypass or the federation pre-check decided
    /// the push without inspecting any line.
    pub decisions: Vec<LineDecision>,
    /// Whether the push as a whole is accepted.
    pub accepted: bool,
}

impl AdmissionOutcome {
    /// The single status byte written back to the hook helper.
    #[must_use]
    pub const fn status_byte(&self) -> u8 {
        if self.accepted {
            0
        } else {
            1
        }
    }
}

/// The snapshot of a push session the state machine reads.
///
/// A value type rather than a borrow of [`PushSession`] so tests can
/// construct one directly.
#[derive(Debug, Clone)]
pub struct SessionView {
    /// Whether the pusher has direct (maintainer) access.
    pub direct_access: bool,
    /// Filesystem path of the repository, for ancestry checks.
    pub repo_path: PathBuf,
    /// Record-store id of the repository.
    pub repo_id: i64,
    /// Repository name, for URL construction.
    pub repo_name: String,
    /// Group path segments, for URL construction.
    pub group_path: Vec<String>,
    /// The pusher's user id, when known.
    pub user_id: Option<i64>,
    /// How the pusher is known to the forge.
    pub user_kind: UserKind,
    /// The repository's contribution policy.
    pub contrib_policy: ContributionPolicy,
    /// The pusher's public key; empty when none was presented.
    pub pubkey: String,
}

impl SessionView {
    /// Snapshots the fields admission needs from a registered session.
    #[must_use]
    pub fn of(session: &PushSession) -> Self {
        Self {
            direct_access: session.direct_access,
            repo_path: session.repo_path.clone(),
            repo_id: session.repo_id,
            repo_name: session.repo_name.clone(),
            group_path: session.group_path.clone(),
            user_id: session.user_id,
            user_kind: session.user_kind,
            contrib_policy: session.contrib_policy,
            pubkey: session.pubkey.clone(),
        }
    }
}

/// The injected collaborators admission calls out to.
pub struct AdmissionEnv<'a> {
    /// Merge-request and user records.
    pub store: &'a dyn RecordStore,
    /// Fast-forward oracle.
    pub ancestry: &'a dyn AncestryProvider,
    /// Out-of-band federated-identity verification.
    pub federation: &'a dyn FederationVerifier,
    /// Best-effort announcement channel for new merge requests.
    pub notifier: &'a dyn Notifier,
    /// Web root for constructing merge-request URLs.
    pub web_root: &'a str,
}

async fn say<W: AsyncWrite + Unpin + ?Sized>(out: &mut W, text: &str) -> std::io::Result<()> {
    out.write_all(text.as_bytes()).await?;
    out.write_all(b"\n").await
}

async fn say_red<W: AsyncWrite + Unpin + ?Sized>(out: &mut W, text: &str) -> std::io::Result<()> {
    say(out, &format!("{}{text}{}", ansi::RED, ansi::RESET)).await
}

async fn nak<W: AsyncWrite + Unpin + ?Sized>(
    out: &mut W,
    ref_name: &str,
    reason: RejectReason,
) -> std::io::Result<()> {
    say(
        out,
        &format!(
            "{}NAK{} {ref_name} ({})",
            ansi::RED,
            ansi::RESET,
            reason.as_str()
        ),
    )
    .await
}

async fn pok<W: AsyncWrite + Unpin + ?Sized>(out: &mut W, ref_name: &str) -> std::io::Result<()> {
    say(out, &format!("{}POK{} {ref_name}", ansi::BLUE, ansi::RESET)).await
}

/// Runs the federated-policy pre-check; returns `false` when the push
/// must be rejected before any line is evaluated.
async fn federated_precheck<W: AsyncWrite + Unpin + ?Sized>(
    session: &SessionView,
    push_options: &[String],
    env: &AdmissionEnv<'_>,
    feedback: &mut W,
) -> Result<bool, AdmissionError> {
    let Some(claim) = push_options
        .iter()
        .find_map(|opt| opt.strip_prefix("fedid="))
    else {
        say_red(
            feedback,
            "this repository requires contributors to be federated or registered users; \
             supply your federated identity as a push option, for example: \
             git push -o fedid=sr.ht:user",
        )
        .await?;
        return Ok(false);
    };

    let (service, username) = claim.split_once(':').ok_or_else(|| {
        AdmissionError::InvalidFedClaim {
            claim: claim.to_owned(),
        }
    })?;

    let verified = env
        .federation
        .verify(session.user_id, service, username, &session.pubkey)
        .await?;
    if !verified {
        say_red(
            feedback,
            &format!("failed to verify federated identity {claim:?}: your key is not on the list"),
        )
        .await?;
        return Ok(false);
    }
    Ok(true)
}

/// Evaluates one push's ref-update lines to an accept/reject verdict.
///
/// Writes the per-line POK/NAK transcript and the overall footer to
/// `feedback`. Decisions are made strictly in line order.
///
/// # Errors
///
/// Returns [`AdmissionError`] on infrastructure failures; per-line
/// rejections are reported through the returned [`AdmissionOutcome`]
/// instead.
pub async fn evaluate<W: AsyncWrite + Unpin + ?Sized>(
    session: &SessionView,
    lines: &[RefLine],
    push_options: &[String],
    env: &AdmissionEnv<'_>,
    feedback: &mut W,
) -> Result<AdmissionOutcome, AdmissionError> {
    // Maintainers bypass the whole machine; no line is inspected.
    if session.direct_access {
        info!(repo_id = session.repo_id, "direct access, push accepted");
        return Ok(AdmissionOutcome {
            decisions: Vec::new(),
            accepted: true,
        });
    }

    if session.contrib_policy == ContributionPolicy::Federated
        && !session.user_kind.is_trusted_for_federated()
        && !federated_precheck(session, push_options, env, feedback).await?
    {
        return Ok(AdmissionOutcome {
            decisions: Vec::new(),
            accepted: false,
        });
    }

    let mut decisions = Vec::with_capacity(lines.len());
    for line in lines {
        let outcome = evaluate_line(session, line, env, feedback).await?;
        decisions.push(LineDecision {
            line: line.clone(),
            outcome,
        });
    }

    let accepted = decisions.iter().all(|d| d.outcome.is_accepted());
    feedback.write_all(b"\n").await?;
    if accepted {
        say(
            feedback,
            &format!(
                "Overall {}ACK{} (all checks passed)",
                ansi::GREEN,
                ansi::RESET
            ),
        )
        .await?;
    } else {
        say(
            feedback,
            &format!(
                "Overall {}NAK{} (one or more branches failed checks)",
                ansi::RED,
                ansi::RESET
            ),
        )
        .await?;
    }
    info!(
        repo_id = session.repo_id,
        lines = decisions.len(),
        accepted,
        "pre-receive decided"
    );

    Ok(AdmissionOutcome {
        decisions,
        accepted,
    })
}

async fn evaluate_line<W: AsyncWrite + Unpin + ?Sized>(
    session: &SessionView,
    line: &RefLine,
    env: &AdmissionEnv<'_>,
    feedback: &mut W,
) -> Result<LineOutcome, AdmissionError> {
    if !line.ref_name.starts_with(CONTRIB_PREFIX) {
        nak(feedback, &line.ref_name, RejectReason::OutsideContrib).await?;
        return Ok(LineOutcome::Rejected(RejectReason::OutsideContrib));
    }

    if line.old.is_zero() {
        return create_merge_request(session, line, env, feedback).await;
    }
    update_contrib_branch(session, line, env, feedback).await
}

async fn create_merge_request<W: AsyncWrite + Unpin + ?Sized>(
    session: &SessionView,
    line: &RefLine,
    env: &AdmissionEnv<'_>,
    feedback: &mut W,
) -> Result<LineOutcome, AdmissionError> {
    pok(feedback, &line.ref_name).await?;

    let local_id = env
        .store
        .create_merge_request(session.repo_id, session.user_id, line.source_ref())?;
    let repo_url = urls::repo_web_url(env.web_root, &session.group_path, &session.repo_name);
    let url = urls::merge_request_url(&repo_url, local_id);
    say(
        feedback,
        &format!(
            "{}Created merge request at {url}{}",
            ansi::BLUE,
            ansi::RESET
        ),
    )
    .await?;
    env.notifier.notify_merge_request(&url);

    Ok(LineOutcome::MergeRequestCreated { local_id, url })
}

async fn update_contrib_branch<W: AsyncWrite + Unpin + ?Sized>(
    session: &SessionView,
    line: &RefLine,
    env: &AdmissionEnv<'_>,
    feedback: &mut W,
) -> Result<LineOutcome, AdmissionError> {
    let Some(mr) = env
        .store
        .find_merge_request(session.repo_id, line.source_ref())?
    else {
        warn!(
            repo_id = session.repo_id,
            source_ref = line.source_ref(),
            "existing contrib branch without a merge request"
        );
        nak(feedback, &line.ref_name, RejectReason::MissingMergeRequest).await?;
        return Ok(LineOutcome::Rejected(RejectReason::MissingMergeRequest));
    };

    let Some(creator) = mr.creator else {
        nak(feedback, &line.ref_name, RejectReason::UnownedMergeRequest).await?;
        return Ok(LineOutcome::Rejected(RejectReason::UnownedMergeRequest));
    };
    if session.user_id != Some(creator) {
        nak(feedback, &line.ref_name, RejectReason::ForeignMergeRequest).await?;
        return Ok(LineOutcome::Rejected(RejectReason::ForeignMergeRequest));
    }

    let fast_forward = env
        .ancestry
        .is_ancestor(&session.repo_path, &line.old, &line.new)
        .await?;
    if !fast_forward {
        nak(feedback, &line.ref_name, RejectReason::NonFastForward).await?;
        return Ok(LineOutcome::Rejected(RejectReason::NonFastForward));
    }

    pok(feedback, &line.ref_name).await?;
    Ok(LineOutcome::Accepted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const ZERO: &str = "0000000000000000000000000000000000000000";
    const OLD: &str = "1111111111111111111111111111111111111111";
    const NEW: &str = "2222222222222222222222222222222222222222";

    /// Ancestry oracle with a canned verdict.
    struct FixedAncestry(bool);

    #[async_trait]
    impl AncestryProvider for FixedAncestry {
        async fn is_ancestor(
            &self,
            _repo: &Path,
            _old: &Oid,
            _new: &Oid,
        ) -> Result<bool, AncestryError> {
            Ok(self.0)
        }
    }

    /// Federation verifier with a canned verdict.
    struct FixedFederation(bool);

    #[async_trait]
    impl FederationVerifier for FixedFederation {
        async fn verify(
            &self,
            _user_id: Option<i64>,
            _service: &str,
            _remote_username: &str,
            _pubkey: &str,
        ) -> Result<bool, FedAuthError> {
            Ok(self.0)
        }
    }

    /// Notifier that records announced URLs.
    #[derive(Default)]
    struct RecordingNotifier(std::sync::Mutex<Vec<String>>);

    impl Notifier for RecordingNotifier {
        fn notify_merge_request(&self, url: &str) {
            self.0.lock().unwrap().push(url.to_owned());
        }
    }

    struct Fixture {
        store: MemoryStore,
        ancestry: FixedAncestry,
        federation: FixedFederation,
        notifier: RecordingNotifier,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: MemoryStore::new(),
                ancestry: FixedAncestry(true),
                federation: FixedFederation(true),
                notifier: RecordingNotifier::default(),
            }
        }

        fn env(&self) -> AdmissionEnv<'_> {
            AdmissionEnv {
                store: &self.store,
                ancestry: &self.ancestry,
                federation: &self.federation,
                notifier: &self.notifier,
                web_root: "https://forge.example.org",
            }
        }
    }

    fn session(repo_id: i64, user_id: Option<i64>, kind: UserKind) -> SessionView {
        SessionView {
            direct_access: false,
            repo_path: PathBuf::from("/repos/demo.git"),
            repo_id,
            repo_name: "demo".to_owned(),
            group_path: vec!["infra".to_owned()],
            user_id,
            user_kind: kind,
            contrib_policy: ContributionPolicy::Public,
            pubkey: "ssh-ed25519 AAAA".to_owned(),
        }
    }

    fn line(old: &str, new: &str, ref_name: &str) -> RefLine {
        RefLine::parse(&format!("{old} {new} {ref_name}")).unwrap()
    }

    async fn run(
        view: &SessionView,
        lines: &[RefLine],
        options: &[String],
        fixture: &Fixture,
    ) -> (AdmissionOutcome, String) {
        let mut transcript = Vec::new();
        let outcome = evaluate(view, lines, options, &fixture.env(), &mut transcript)
            .await
            .unwrap();
        (outcome, String::from_utf8(transcript).unwrap())
    }

    #[test]
    fn ref_line_parsing() {
        let parsed = line(ZERO, NEW, "refs/heads/contrib/foo");
        assert!(parsed.old.is_zero());
        assert_eq!(parsed.source_ref(), "contrib/foo");

        assert!(RefLine::parse("only two fields").is_err());
        assert!(RefLine::parse("zzz zzz refs/heads/x").is_err());

        let all = RefLine::parse_all(
            format!("{ZERO} {NEW} refs/heads/contrib/a\n{OLD} {NEW} refs/heads/contrib/b\n")
                .as_bytes(),
        )
        .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn new_contrib_branch_creates_one_merge_request() {
        let fixture = Fixture::new();
        let repo = fixture.store.add_repo(ContributionPolicy::Public);
        let user = fixture.store.add_user(UserKind::Registered, None);
        let view = session(repo, Some(user), UserKind::Registered);

        let lines = [line(ZERO, NEW, "refs/heads/contrib/foo")];
        let (outcome, transcript) = run(&view, &lines, &[], &fixture).await;

        assert!(outcome.accepted);
        assert_eq!(outcome.status_byte(), 0);
        assert_eq!(fixture.store.merge_request_count(), 1);
        let mr = fixture
            .store
            .find_merge_request(repo, "contrib/foo")
            .unwrap()
            .unwrap();
        assert_eq!(mr.creator, Some(user));
        assert_eq!(mr.status, "open");

        assert!(transcript.contains("POK refs/heads/contrib/foo"));
        assert!(transcript
            .contains("https://forge.example.org/infra/-/repos/demo/contrib/1/"));
        assert!(transcript.contains("ACK"));
        assert_eq!(fixture.notifier.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn non_fast_forward_rejects_without_mutations() {
        let fixture = Fixture::new();
        let repo = fixture.store.add_repo(ContributionPolicy::Public);
        let user = fixture.store.add_user(UserKind::Registered, None);
        fixture
            .store
            .create_merge_request(repo, Some(user), "contrib/foo")
            .unwrap();
        let view = session(repo, Some(user), UserKind::Registered);

        let fixture = Fixture {
            ancestry: FixedAncestry(false),
            ..fixture
        };
        let lines = [line(OLD, NEW, "refs/heads/contrib/foo")];
        let (outcome, transcript) = run(&view, &lines, &[], &fixture).await;

        assert!(!outcome.accepted);
        assert_eq!(outcome.status_byte(), 1);
        assert_eq!(
            outcome.decisions[0].outcome,
            LineOutcome::Rejected(RejectReason::NonFastForward)
        );
        // The existing merge request is the only one; nothing was created.
        assert_eq!(fixture.store.merge_request_count(), 1);
        assert!(transcript.contains("NAK"));
        assert!(transcript.contains("force pushes are not supported"));
    }

    #[tokio::test]
    async fn fast_forward_update_by_owner_accepted() {
        let fixture = Fixture::new();
        let repo = fixture.store.add_repo(ContributionPolicy::Public);
        let user = fixture.store.add_user(UserKind::Registered, None);
        fixture
            .store
            .create_merge_request(repo, Some(user), "contrib/foo")
            .unwrap();
        let view = session(repo, Some(user), UserKind::Registered);

        let lines = [line(OLD, NEW, "refs/heads/contrib/foo")];
        let (outcome, _) = run(&view, &lines, &[], &fixture).await;

        assert!(outcome.accepted);
        assert_eq!(outcome.decisions[0].outcome, LineOutcome::Accepted);
    }

    #[tokio::test]
    async fn maintainer_bypass_skips_all_checks() {
        let fixture = Fixture::new();
        // No repo, no user rows: any store access would fail, proving the
        // bypass inspects nothing.
        let mut view = session(999, None, UserKind::Unknown);
        view.direct_access = true;

        let lines = [line(OLD, NEW, "refs/heads/main")];
        let (outcome, transcript) = run(&view, &lines, &[], &fixture).await;

        assert!(outcome.accepted);
        assert!(outcome.decisions.is_empty());
        assert!(transcript.is_empty());
    }

    #[tokio::test]
    async fn refs_outside_contrib_rejected_but_evaluation_continues() {
        let fixture = Fixture::new();
        let repo = fixture.store.add_repo(ContributionPolicy::Public);
        let user = fixture.store.add_user(UserKind::Registered, None);
        let view = session(repo, Some(user), UserKind::Registered);

        let lines = [
            line(ZERO, NEW, "refs/heads/main"),
            line(ZERO, NEW, "refs/heads/contrib/ok"),
        ];
        let (outcome, _) = run(&view, &lines, &[], &fixture).await;

        assert!(!outcome.accepted);
        assert_eq!(outcome.decisions.len(), 2);
        assert_eq!(
            outcome.decisions[0].outcome,
            LineOutcome::Rejected(RejectReason::OutsideContrib)
        );
        // The later line was still evaluated and created its MR.
        assert!(outcome.decisions[1].outcome.is_accepted());
        assert_eq!(fixture.store.merge_request_count(), 1);
    }

    #[tokio::test]
    async fn anonymous_merge_request_never_updatable() {
        let fixture = Fixture::new();
        let repo = fixture.store.add_repo(ContributionPolicy::Public);
        fixture
            .store
            .create_merge_request(repo, None, "contrib/anon")
            .unwrap();
        let user = fixture.store.add_user(UserKind::Registered, None);
        let view = session(repo, Some(user), UserKind::Registered);

        let lines = [line(OLD, NEW, "refs/heads/contrib/anon")];
        let (outcome, _) = run(&view, &lines, &[], &fixture).await;

        assert_eq!(
            outcome.decisions[0].outcome,
            LineOutcome::Rejected(RejectReason::UnownedMergeRequest)
        );
    }

    #[tokio::test]
    async fn foreign_merge_request_rejected() {
        let fixture = Fixture::new();
        let repo = fixture.store.add_repo(ContributionPolicy::Public);
        let owner = fixture.store.add_user(UserKind::Registered, None);
        let other = fixture.store.add_user(UserKind::Registered, None);
        fixture
            .store
            .create_merge_request(repo, Some(owner), "contrib/foo")
            .unwrap();
        let view = session(repo, Some(other), UserKind::Registered);

        let lines = [line(OLD, NEW, "refs/heads/contrib/foo")];
        let (outcome, _) = run(&view, &lines, &[], &fixture).await;

        assert_eq!(
            outcome.decisions[0].outcome,
            LineOutcome::Rejected(RejectReason::ForeignMergeRequest)
        );
    }

    #[tokio::test]
    async fn missing_merge_request_rejects_line_only() {
        let fixture = Fixture::new();
        let repo = fixture.store.add_repo(ContributionPolicy::Public);
        let user = fixture.store.add_user(UserKind::Registered, None);
        let view = session(repo, Some(user), UserKind::Registered);

        let lines = [
            line(OLD, NEW, "refs/heads/contrib/ghost"),
            line(ZERO, NEW, "refs/heads/contrib/fresh"),
        ];
        let (outcome, _) = run(&view, &lines, &[], &fixture).await;

        assert!(!outcome.accepted);
        assert_eq!(
            outcome.decisions[0].outcome,
            LineOutcome::Rejected(RejectReason::MissingMergeRequest)
        );
        assert!(outcome.decisions[1].outcome.is_accepted());
    }

    #[tokio::test]
    async fn federated_policy_requires_push_option() {
        let fixture = Fixture::new();
        let repo = fixture.store.add_repo(ContributionPolicy::Federated);
        let user = fixture.store.add_user(UserKind::PubkeyOnly, None);
        let mut view = session(repo, Some(user), UserKind::PubkeyOnly);
        view.contrib_policy = ContributionPolicy::Federated;

        let lines = [line(ZERO, NEW, "refs/heads/contrib/foo")];
        let (outcome, transcript) = run(&view, &lines, &[], &fixture).await;

        assert!(!outcome.accepted);
        assert!(outcome.decisions.is_empty());
        assert_eq!(fixture.store.merge_request_count(), 0);
        assert!(transcript.contains("fedid="));
    }

    #[tokio::test]
    async fn federated_policy_rejects_unverified_claim() {
        let fixture = Fixture {
            federation: FixedFederation(false),
            ..Fixture::new()
        };
        let repo = fixture.store.add_repo(ContributionPolicy::Federated);
        let user = fixture.store.add_user(UserKind::PubkeyOnly, None);
        let mut view = session(repo, Some(user), UserKind::PubkeyOnly);
        view.contrib_policy = ContributionPolicy::Federated;

        let lines = [line(ZERO, NEW, "refs/heads/contrib/foo")];
        let options = ["fedid=sr.ht:alice".to_owned()];
        let (outcome, transcript) = run(&view, &lines, &options, &fixture).await;

        assert!(!outcome.accepted);
        assert!(outcome.decisions.is_empty());
        assert!(transcript.contains("not on the list"));
    }

    #[tokio::test]
    async fn federated_policy_verified_claim_proceeds() {
        let fixture = Fixture::new();
        let repo = fixture.store.add_repo(ContributionPolicy::Federated);
        let user = fixture.store.add_user(UserKind::PubkeyOnly, None);
        let mut view = session(repo, Some(user), UserKind::PubkeyOnly);
        view.contrib_policy = ContributionPolicy::Federated;

        let lines = [line(ZERO, NEW, "refs/heads/contrib/foo")];
        let options = ["fedid=sr.ht:alice".to_owned()];
        let (outcome, _) = run(&view, &lines, &options, &fixture).await;

        assert!(outcome.accepted);
        assert_eq!(fixture.store.merge_request_count(), 1);
    }

    #[tokio::test]
    async fn registered_user_skips_federation_check() {
        // The verifier would reject, but a registered user is never asked.
        let fixture = Fixture {
            federation: FixedFederation(false),
            ..Fixture::new()
        };
        let repo = fixture.store.add_repo(ContributionPolicy::Federated);
        let user = fixture.store.add_user(UserKind::Registered, None);
        let mut view = session(repo, Some(user), UserKind::Registered);
        view.contrib_policy = ContributionPolicy::Federated;

        let lines = [line(ZERO, NEW, "refs/heads/contrib/foo")];
        let (outcome, _) = run(&view, &lines, &[], &fixture).await;
        assert!(outcome.accepted);
    }

    #[tokio::test]
    async fn malformed_fed_claim_is_an_error() {
        let fixture = Fixture::new();
        let repo = fixture.store.add_repo(ContributionPolicy::Federated);
        let mut view = session(repo, None, UserKind::Unknown);
        view.contrib_policy = ContributionPolicy::Federated;

        let mut transcript = Vec::new();
        let err = evaluate(
            &view,
            &[],
            &["fedid=nocolon".to_owned()],
            &fixture.env(),
            &mut transcript,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AdmissionError::InvalidFedClaim { .. }));
    }

    #[tokio::test]
    async fn empty_line_set_accepts() {
        let fixture = Fixture::new();
        let repo = fixture.store.add_repo(ContributionPolicy::Public);
        let view = session(repo, None, UserKind::Unknown);

        let (outcome, transcript) = run(&view, &[], &[], &fixture).await;
        assert!(outcome.accepted);
        assert!(transcript.contains("ACK"));
    }
}
