//! The tool broker: policy, approval and audit around one upstream.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tracing::{info, warn};
use warden_audit::{EntryDraft, EventType, Ledger};
use warden_core::{AuditId, GatewayId, Timestamp};
use warden_policy::{Decision, GatewayPolicy};

use crate::approval::{PendingApproval, PendingMap};
use crate::error::{BrokerError, BrokerResult};
use crate::rpc::RpcClient;
use crate::types::{BrokerStats, ConnectSummary, ServerSpec, ToolDefinition, ToolResult};

/// Default timeout for upstream requests.
pub(crate) const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One governed tool call.
#[derive(Debug, Clone)]
pub struct CallRequest {
    /// Tool to invoke.
    pub tool: String,
    /// Arguments to pass through.
    pub arguments: Value,
    /// Persona making the call.
    pub persona: Option<String>,
    /// Role making the call.
    pub role: Option<String>,
    /// Why the agent wants this (recorded in the ledger).
    pub reasoning: Option<String>,
    /// Token id of the certificate that authorized the caller.
    pub cc_token_id: Option<String>,
}

impl CallRequest {
    /// A bare request with no caller context.
    pub fn new(tool: impl Into<String>, arguments: Value) -> Self {
        Self {
            tool: tool.into(),
            arguments,
            persona: None,
            role: None,
            reasoning: None,
            cc_token_id: None,
        }
    }

    /// Set the persona.
    #[must_use]
    pub fn persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = Some(persona.into());
        self
    }

    /// Set the role.
    #[must_use]
    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Set the reasoning trace.
    #[must_use]
    pub fn reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }
}

/// Governance outcome of a call.
#[derive(Debug)]
pub enum CallOutcome {
    /// The call ran; here is the upstream result.
    Completed(ToolResult),
    /// The call is parked; poll or resolve with the audit id.
    Pending {
        /// Audit id keying the pending approval.
        audit_id: AuditId,
    },
    /// Policy (or an approver) said no.
    Denied {
        /// Why.
        reason: String,
    },
}

impl CallOutcome {
    /// Whether the call completed upstream.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// Stateful bridge to one stdio tool server.
pub struct ToolBroker {
    gateway_id: GatewayId,
    policy: GatewayPolicy,
    ledger: Arc<Ledger>,
    rpc: RpcClient,
    all_tools: Mutex<Vec<ToolDefinition>>,
    pending: Arc<PendingMap>,
    request_counter: AtomicU64,
    rate_windows: Mutex<std::collections::HashMap<String, Vec<Instant>>>,
    server_info: Value,
}

impl ToolBroker {
    /// Spawn the tool server, run the handshake, discover tools and
    /// record the connection in the ledger.
    ///
    /// `pending` is shared user state owned by the pool; it survives
    /// broker rebuilds.
    ///
    /// # Errors
    ///
    /// Returns an error if the subprocess cannot start, the handshake
    /// fails, or the ledger refuses the connect entry.
    pub async fn connect(
        gateway_id: GatewayId,
        spec: &ServerSpec,
        policy: GatewayPolicy,
        ledger: Arc<Ledger>,
        pending: Arc<PendingMap>,
        request_timeout: Option<Duration>,
    ) -> BrokerResult<Self> {
        let rpc = RpcClient::spawn(spec, request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT))?;

        let server_info = match rpc.initialize().await {
            Ok(info) => info,
            Err(e) => {
                rpc.shutdown();
                return Err(e);
            },
        };
        let tools = match rpc.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                rpc.shutdown();
                return Err(e);
            },
        };

        let broker = Self {
            gateway_id,
            policy,
            ledger,
            rpc,
            all_tools: Mutex::new(tools),
            pending,
            request_counter: AtomicU64::new(0),
            rate_windows: Mutex::new(std::collections::HashMap::new()),
            server_info,
        };

        let summary = broker.connect_summary();
        let connect_entry = broker.ledger.append(
            EntryDraft::new(EventType::GatewayConnect, broker.gateway_id.as_str()).result(
                json!({
                    "total_tools": summary.total_tools,
                    "allowed_tools": summary.allowed_tools,
                    "blocked_tools": summary.blocked_tools,
                }),
            ),
        );
        if let Err(e) = connect_entry {
            broker.rpc.shutdown();
            return Err(e.into());
        }

        info!(
            gateway = %broker.gateway_id,
            tools = summary.total_tools,
            exposed = summary.allowed_tools,
            "broker connected"
        );
        Ok(broker)
    }

    /// This broker's gateway id.
    #[must_use]
    pub fn gateway_id(&self) -> &GatewayId {
        &self.gateway_id
    }

    /// The policy governing this broker.
    #[must_use]
    pub fn policy(&self) -> &GatewayPolicy {
        &self.policy
    }

    /// Whether the subprocess is still running.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.rpc.is_alive()
    }

    /// The policy-filtered catalog exposed to agents (the "virtual"
    /// tool server), with description overrides applied.
    #[must_use]
    pub fn tools(&self) -> Vec<ToolDefinition> {
        let Ok(all) = self.all_tools.lock() else {
            return Vec::new();
        };
        all.iter()
            .filter(|t| self.policy.is_exposed(&t.name))
            .map(|t| {
                let mut tool = t.clone();
                if let Some(p) = self.policy.tool_policy(&t.name)
                    && let Some(description) = &p.description
                {
                    tool.description = description.clone();
                }
                tool
            })
            .collect()
    }

    /// The unfiltered upstream catalog (admin/audit view).
    #[must_use]
    pub fn all_tools(&self) -> Vec<ToolDefinition> {
        self.all_tools.lock().map(|t| t.clone()).unwrap_or_default()
    }

    /// Re-run tool discovery against the upstream.
    ///
    /// # Errors
    ///
    /// Propagates transport errors.
    pub async fn refresh_tools(&self) -> BrokerResult<usize> {
        let tools = self.rpc.list_tools().await?;
        let count = tools.len();
        if let Ok(mut all) = self.all_tools.lock() {
            *all = tools;
        }
        Ok(count)
    }

    /// What this broker learned at connect time.
    #[must_use]
    pub fn connect_summary(&self) -> ConnectSummary {
        let total = self.all_tools().len();
        let allowed = self.tools().len();
        ConnectSummary {
            server_info: self.server_info.clone(),
            total_tools: total,
            allowed_tools: allowed,
            blocked_tools: total.saturating_sub(allowed),
        }
    }

    /// Run one call through the governance pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error for transport or ledger failures; governance
    /// outcomes (denial, parking) are reported in [`CallOutcome`].
    pub async fn call(&self, request: CallRequest) -> BrokerResult<CallOutcome> {
        let audit_id = AuditId::generate();
        self.dispatch(&audit_id, request, false).await
    }

    /// Resolve a parked approval.
    ///
    /// Approval re-enters dispatch with the approval gate lifted; the
    /// original audit id threads every resulting ledger entry.
    ///
    /// # Errors
    ///
    /// [`BrokerError::ApprovalNotFound`] if no live entry exists for
    /// the audit id; otherwise transport and ledger errors.
    pub async fn resolve(
        &self,
        audit_id: &AuditId,
        approver: &str,
        approved: bool,
    ) -> BrokerResult<CallOutcome> {
        let pending = self
            .pending
            .remove(audit_id)
            .ok_or_else(|| BrokerError::ApprovalNotFound(audit_id.as_str().to_string()))?;

        self.ledger.append(
            EntryDraft::new(EventType::ApprovalResolved, self.gateway_id.as_str())
                .tool(&pending.tool)
                .correlation_id(audit_id.as_str())
                .result(json!({ "approved": approved, "approver": approver })),
        )?;

        if !approved {
            return Ok(CallOutcome::Denied {
                reason: format!("denied by {approver}"),
            });
        }

        let request = CallRequest {
            tool: pending.tool,
            arguments: pending.arguments,
            persona: pending.persona,
            role: pending.role,
            reasoning: pending.reasoning,
            cc_token_id: pending.cc_token_id,
        };
        self.dispatch(audit_id, request, true).await
    }

    /// Snapshot of parked approvals.
    #[must_use]
    pub fn pending_approvals(&self) -> Vec<PendingApproval> {
        self.pending.list()
    }

    /// Broker statistics.
    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            connected: self.is_connected(),
            total_tools: self.all_tools().len(),
            allowed_tools: self.tools().len(),
            pending_approvals: self.pending.len(),
            total_requests: self.request_counter.load(Ordering::Relaxed),
        }
    }

    /// Terminate the subprocess and record the disconnect.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger refuses the disconnect entry.
    pub fn shutdown(&self) -> BrokerResult<()> {
        self.rpc.shutdown();
        self.ledger.append(EntryDraft::new(
            EventType::GatewayDisconnect,
            self.gateway_id.as_str(),
        ))?;
        Ok(())
    }

    async fn dispatch(
        &self,
        audit_id: &AuditId,
        request: CallRequest,
        skip_approval: bool,
    ) -> BrokerResult<CallOutcome> {
        self.request_counter.fetch_add(1, Ordering::Relaxed);

        let decision = self.policy.decide(
            &request.tool,
            request.persona.as_deref(),
            request.role.as_deref(),
        );

        match decision {
            Decision::Deny { reason } => {
                self.ledger.append(
                    self.draft(EventType::PolicyCheck, audit_id, &request)
                        .error(format!("policy denied: {reason}")),
                )?;
                Ok(CallOutcome::Denied { reason })
            },

            Decision::NeedsApproval { approvers } if !skip_approval => {
                self.pending.insert(PendingApproval {
                    id: audit_id.clone(),
                    tool: request.tool.clone(),
                    arguments: request.arguments.clone(),
                    approvers: approvers.clone(),
                    created_at: Timestamp::now(),
                    expires_at: None,
                    persona: request.persona.clone(),
                    role: request.role.clone(),
                    reasoning: request.reasoning.clone(),
                    cc_token_id: request.cc_token_id.clone(),
                });

                self.ledger.append(
                    self.draft(EventType::ApprovalPending, audit_id, &request)
                        .result(json!({ "approvers": approvers })),
                )?;

                Ok(CallOutcome::Pending {
                    audit_id: audit_id.clone(),
                })
            },

            _ => self.execute(audit_id, &request).await,
        }
    }

    async fn execute(
        &self,
        audit_id: &AuditId,
        request: &CallRequest,
    ) -> BrokerResult<CallOutcome> {
        if self.rate_limited(&request.tool) {
            self.ledger.append(
                self.draft(EventType::Error, audit_id, request)
                    .error("rate limit exceeded"),
            )?;
            return Ok(CallOutcome::Denied {
                reason: "rate limit exceeded".to_string(),
            });
        }

        if !self.rpc.is_alive() {
            self.ledger.append(
                self.draft(EventType::Error, audit_id, request)
                    .error("broker down"),
            )?;
            return Err(BrokerError::Down);
        }

        self.ledger
            .append(self.draft(EventType::ToolDispatch, audit_id, request))?;

        let start = Instant::now();
        match self
            .rpc
            .call_tool(&request.tool, request.arguments.clone())
            .await
        {
            Ok(result) => {
                let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
                self.ledger.append(
                    self.draft(EventType::ToolCall, audit_id, request).result(json!({
                        "content": result.content,
                        "is_error": result.is_error,
                        "duration_ms": duration_ms,
                    })),
                )?;
                Ok(CallOutcome::Completed(result))
            },
            Err(e) => {
                warn!(gateway = %self.gateway_id, tool = %request.tool, error = %e, "tool call failed");
                self.ledger.append(
                    self.draft(EventType::ToolCall, audit_id, request)
                        .error(e.to_string()),
                )?;
                Err(e)
            },
        }
    }

    fn draft(&self, event_type: EventType, audit_id: &AuditId, request: &CallRequest) -> EntryDraft {
        let mut draft = EntryDraft::new(event_type, self.gateway_id.as_str())
            .tool(&request.tool)
            .arguments(request.arguments.clone())
            .correlation_id(audit_id.as_str());
        if let Some(persona) = &request.persona {
            draft = draft.persona(persona);
        }
        if let Some(role) = &request.role {
            draft = draft.role(role);
        }
        if let Some(reasoning) = &request.reasoning {
            draft = draft.reasoning(reasoning);
        }
        if let Some(token_id) = &request.cc_token_id {
            draft = draft.cc_token_id(token_id);
        }
        draft
    }

    /// Per-session sliding-window rate limit for one tool.
    fn rate_limited(&self, tool: &str) -> bool {
        let Some(limit) = self
            .policy
            .tool_policy(tool)
            .and_then(|p| p.rate_limit)
        else {
            return false;
        };

        let Ok(mut windows) = self.rate_windows.lock() else {
            return false;
        };
        let now = Instant::now();
        let window = windows.entry(tool.to_string()).or_default();
        if let Some(cutoff) = now.checked_sub(Duration::from_secs(60)) {
            window.retain(|t| *t > cutoff);
        }
        if window.len() >= limit.per_minute as usize {
            return true;
        }
        window.push(now);
        false
    }
}

impl std::fmt::Debug for ToolBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolBroker")
            .field("gateway_id", &self.gateway_id)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}
