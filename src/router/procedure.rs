use anyhow::Result;
use log::{
    debug,
    warn,
};

use crate::{
    core::{
        error::{
            BasicError,
            InteractionError,
        },
        id::Id,
        roles::RouterRole,
        types::{
            Dictionary,
            HashMap,
            HashSet,
            Value,
        },
        uri::Uri,
    },
    message::message::{
        CallMessage,
        ErrorMessage,
        InvocationMessage,
        Message,
        ResultMessage,
        YieldMessage,
    },
    router::context::RealmContext,
};

/// A unique binding of a procedure URI to a callee session.
pub struct Procedure {
    pub registration_id: Id,
    pub procedure: Uri,
    pub callee: Id,
}

/// An in-flight CALL awaiting the callee's YIELD or ERROR.
#[derive(Debug, Clone)]
pub struct PendingInvocation {
    pub invocation_request_id: Id,
    pub call_request_id: Id,
    pub caller: Id,
    pub callee: Id,
    pub registration_id: Id,
}

/// The dealer state of a realm: registered procedures and outstanding
/// invocations.
///
/// Pending invocations are doubly indexed: by invocation request ID for
/// YIELD/ERROR correlation, and by (caller, call request) for caller-side
/// cleanup. Both indexes share entry lifetimes.
#[derive(Default)]
pub struct ProcedureManager {
    procedures: HashMap<Id, Procedure>,
    procedures_by_uri: HashMap<Uri, Id>,
    procedures_by_session: HashMap<Id, HashSet<Id>>,
    pending_invocations: HashMap<Id, PendingInvocation>,
    pending_invocations_by_call: HashMap<(Id, Id), Id>,
}

impl ProcedureManager {
    /// The registration for a procedure, if one exists.
    pub fn procedure(&self, procedure: &Uri) -> Option<&Procedure> {
        self.procedures_by_uri
            .get(procedure)
            .and_then(|id| self.procedures.get(id))
    }

    /// The number of outstanding invocations in the realm.
    pub fn pending_invocation_count(&self) -> usize {
        self.pending_invocations.len()
    }

    /// Registers a procedure for a callee.
    ///
    /// At most one registration exists per procedure URI in a realm.
    pub async fn register(
        context: &mut RealmContext<'_>,
        session: Id,
        procedure: Uri,
    ) -> Result<Id> {
        if !context.router().config.roles.contains(&RouterRole::Dealer) {
            return Err(BasicError::NotAllowed("router is not a dealer".to_owned()).into());
        }
        procedure
            .validate()
            .map_err(|_| InteractionError::InvalidUri)?;
        if context
            .realm()
            .procedure_manager
            .procedures_by_uri
            .contains_key(&procedure)
        {
            return Err(InteractionError::ProcedureAlreadyExists.into());
        }

        let registration_id = context.router().router_id_allocator.generate_id().await?;
        let manager = &mut context.realm_mut().procedure_manager;
        manager.procedures.insert(
            registration_id,
            Procedure {
                registration_id,
                procedure: procedure.clone(),
                callee: session,
            },
        );
        manager
            .procedures_by_uri
            .insert(procedure, registration_id);
        manager
            .procedures_by_session
            .entry(session)
            .or_default()
            .insert(registration_id);
        Ok(registration_id)
    }

    /// Unregisters a procedure, if the registration is owned by the callee.
    ///
    /// Invocations already in flight are not canceled: the callee may still
    /// YIELD them. They are only canceled if the callee session itself goes
    /// away.
    pub async fn unregister(
        context: &mut RealmContext<'_>,
        session: Id,
        registration_id: Id,
    ) -> Result<()> {
        let manager = &mut context.realm_mut().procedure_manager;
        let owned = manager
            .procedures
            .get(&registration_id)
            .is_some_and(|procedure| procedure.callee == session);
        if !owned {
            return Err(InteractionError::NoSuchRegistration.into());
        }
        if let Some(procedure) = manager.procedures.remove(&registration_id) {
            manager.procedures_by_uri.remove(&procedure.procedure);
        }
        if let Some(registration_ids) = manager.procedures_by_session.get_mut(&session) {
            registration_ids.remove(&registration_id);
            if registration_ids.is_empty() {
                manager.procedures_by_session.remove(&session);
            }
        }
        Ok(())
    }

    /// Routes a CALL: allocates an invocation request ID, records the
    /// pending invocation, and delivers INVOCATION to the callee.
    pub async fn call(
        context: &mut RealmContext<'_>,
        caller: Id,
        message: &CallMessage,
    ) -> Result<()> {
        if !context.router().config.roles.contains(&RouterRole::Dealer) {
            return Err(BasicError::NotAllowed("router is not a dealer".to_owned()).into());
        }
        message
            .procedure
            .validate()
            .map_err(|_| InteractionError::InvalidUri)?;

        let (registration_id, callee) = context
            .realm()
            .procedure_manager
            .procedure(&message.procedure)
            .map(|procedure| (procedure.registration_id, procedure.callee))
            .ok_or(InteractionError::NoSuchProcedure)?;

        let invocation_request_id = context.router().router_id_allocator.generate_id().await?;

        let callee_session = context
            .session(callee)
            .ok_or(InteractionError::Canceled)?;
        callee_session
            .session
            .send_message(Message::Invocation(InvocationMessage {
                request: invocation_request_id,
                registered_registration: registration_id,
                details: Dictionary::default(),
                call_arguments: message.arguments.clone(),
                call_arguments_keyword: message.arguments_keyword.clone(),
            }))
            .map_err(|_| InteractionError::Canceled)?;

        let manager = &mut context.realm_mut().procedure_manager;
        manager.pending_invocations.insert(
            invocation_request_id,
            PendingInvocation {
                invocation_request_id,
                call_request_id: message.request,
                caller,
                callee,
                registration_id,
            },
        );
        manager
            .pending_invocations_by_call
            .insert((caller, message.request), invocation_request_id);
        Ok(())
    }

    /// Routes a YIELD from a callee back to the caller as RESULT.
    ///
    /// A YIELD for an unknown invocation, or from a session other than the
    /// invocation's callee, is dropped: the caller may have disconnected
    /// since the invocation went out.
    pub async fn yield_result(
        context: &mut RealmContext<'_>,
        session: Id,
        message: &YieldMessage,
    ) -> Result<()> {
        let pending =
            match Self::take_pending(context, session, message.invocation_request, "YIELD") {
                Some(pending) => pending,
                None => return Ok(()),
            };

        let caller_session = match context.session(pending.caller) {
            Some(caller_session) => &caller_session.session,
            None => {
                debug!(
                    "Dropping YIELD for invocation {}: caller session {} is gone",
                    pending.invocation_request_id, pending.caller
                );
                return Ok(());
            }
        };
        let result = caller_session.send_message(Message::Result(ResultMessage {
            call_request: pending.call_request_id,
            details: Dictionary::default(),
            yield_arguments: message.arguments.clone(),
            yield_arguments_keyword: message.arguments_keyword.clone(),
        }));
        if let Err(err) = result {
            warn!(
                "Failed to deliver RESULT for call {} to session {}: {err}",
                pending.call_request_id, pending.caller
            );
            Self::send_canceled_error(context, &pending);
        }
        Ok(())
    }

    /// Routes an ERROR (to an INVOCATION) from a callee back to the caller.
    ///
    /// Symmetric to [`Self::yield_result`].
    pub async fn error_result(
        context: &mut RealmContext<'_>,
        session: Id,
        message: &ErrorMessage,
    ) -> Result<()> {
        let pending = match Self::take_pending(context, session, message.request, "ERROR") {
            Some(pending) => pending,
            None => return Ok(()),
        };

        let caller_session = match context.session(pending.caller) {
            Some(caller_session) => &caller_session.session,
            None => {
                debug!(
                    "Dropping ERROR for invocation {}: caller session {} is gone",
                    pending.invocation_request_id, pending.caller
                );
                return Ok(());
            }
        };
        let result = caller_session.send_message(Message::Error(ErrorMessage {
            request_type: Message::CALL_TAG,
            request: pending.call_request_id,
            details: message.details.clone(),
            error: message.error.clone(),
            arguments: message.arguments.clone(),
            arguments_keyword: message.arguments_keyword.clone(),
        }));
        if let Err(err) = result {
            warn!(
                "Failed to deliver ERROR for call {} to session {}: {err}",
                pending.call_request_id, pending.caller
            );
        }
        Ok(())
    }

    /// Removes everything a detached session contributed to the dealer.
    ///
    /// As a callee, its registrations disappear and every invocation waiting
    /// on it is answered with a synthesized `wamp.error.canceled`. As a
    /// caller, its pending invocations are discarded so that a late YIELD or
    /// ERROR from the callee drops silently.
    pub async fn detach_session(context: &mut RealmContext<'_>, session: Id) {
        let manager = &mut context.realm_mut().procedure_manager;
        if let Some(registration_ids) = manager.procedures_by_session.remove(&session) {
            for registration_id in registration_ids {
                if let Some(procedure) = manager.procedures.remove(&registration_id) {
                    manager.procedures_by_uri.remove(&procedure.procedure);
                }
            }
        }

        let doomed = manager
            .pending_invocations
            .values()
            .filter(|pending| pending.caller == session || pending.callee == session)
            .map(|pending| pending.invocation_request_id)
            .collect::<Vec<_>>();
        let mut canceled = Vec::default();
        for invocation_request_id in doomed {
            if let Some(pending) = manager.pending_invocations.remove(&invocation_request_id) {
                manager
                    .pending_invocations_by_call
                    .remove(&(pending.caller, pending.call_request_id));
                if pending.callee == session && pending.caller != session {
                    canceled.push(pending);
                }
            }
        }

        for pending in canceled {
            Self::send_canceled_error(context, &pending);
        }
        debug!("Removed all registrations and pending invocations for session {session}");
    }

    /// Removes and returns the pending invocation for a terminal message from
    /// its callee, or logs why the message is being dropped.
    fn take_pending(
        context: &mut RealmContext<'_>,
        session: Id,
        invocation_request_id: Id,
        message_name: &str,
    ) -> Option<PendingInvocation> {
        let manager = &mut context.realm_mut().procedure_manager;
        let callee = manager
            .pending_invocations
            .get(&invocation_request_id)
            .map(|pending| pending.callee);
        match callee {
            Some(callee) if callee == session => {
                let pending = manager.pending_invocations.remove(&invocation_request_id)?;
                manager
                    .pending_invocations_by_call
                    .remove(&(pending.caller, pending.call_request_id));
                Some(pending)
            }
            Some(callee) => {
                debug!(
                    "Dropping {message_name} for invocation {invocation_request_id} from session {session}: invocation belongs to callee {callee}"
                );
                None
            }
            None => {
                debug!(
                    "Dropping {message_name} for unknown invocation {invocation_request_id} from session {session}"
                );
                None
            }
        }
    }

    fn send_canceled_error(context: &RealmContext<'_>, pending: &PendingInvocation) {
        let caller_session = match context.session(pending.caller) {
            Some(caller_session) => &caller_session.session,
            None => return,
        };
        let error: anyhow::Error = InteractionError::Canceled.into();
        let result = caller_session.send_message(Message::Error(ErrorMessage {
            request_type: Message::CALL_TAG,
            request: pending.call_request_id,
            details: Dictionary::from_iter([(
                "message".to_owned(),
                Value::String(error.to_string()),
            )]),
            error: Uri::for_error(&error),
            ..Default::default()
        }));
        if let Err(err) = result {
            warn!(
                "Failed to deliver synthesized ERROR for call {} to session {}: {err}",
                pending.call_request_id, pending.caller
            );
        }
    }
}
