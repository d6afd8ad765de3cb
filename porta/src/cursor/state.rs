//! Named cursor state machine.
//!
//! [`NamedCursorHelper`] validates each transition locally and hands out a
//! [`PqGen`] performing its round trips. The facades only choose how the
//! generator is driven and keep the row position.
use std::{mem, sync::Arc};

use super::{CursorState, DeclareOptions, ScrollMode};
use crate::{
    Result,
    encode::{Encode, Encoded},
    engine::{Command, Execute, PqGen, Ready, Step, step},
    error::StateError,
    pq::{Field, PgResult},
    row::Row,
    sql::Ident,
    transport::{PgTransport, TransactionStatus},
};

#[derive(Debug)]
pub(crate) struct NamedCursorHelper {
    name: String,
    state: CursorState,
    description: Option<Arc<[Field]>>,
    /// Result of the last describe or fetch.
    pgresult: Option<PgResult>,
    hold: bool,
    /// Bound to a portal this object did not declare.
    adopted: bool,
}

impl NamedCursorHelper {
    pub(crate) fn new(name: String) -> NamedCursorHelper {
        NamedCursorHelper {
            name,
            state: CursorState::Unbound,
            description: None,
            pgresult: None,
            hold: false,
            adopted: false,
        }
    }

    pub(crate) fn adopt(name: String) -> NamedCursorHelper {
        NamedCursorHelper { state: CursorState::Declared, adopted: true, ..NamedCursorHelper::new(name) }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn state(&self) -> CursorState {
        self.state
    }

    pub(crate) fn description(&self) -> Option<&[Field]> {
        self.description.as_deref()
    }

    pub(crate) fn pgresult(&self) -> Option<&PgResult> {
        self.pgresult.as_ref()
    }

    /// Returns `true` if a server portal may be bound to this cursor.
    pub(crate) fn is_open(&self) -> bool {
        matches!(self.state, CursorState::Declared | CursorState::Described)
    }

    fn check_open(&self) -> Result<()> {
        match self.state {
            CursorState::Declared | CursorState::Described => Ok(()),
            CursorState::Unbound => Err(StateError::CursorNotExecuted.into()),
            CursorState::Closed => Err(StateError::CursorClosed.into()),
        }
    }

    fn describe_command(&self) -> Execute {
        Execute::new(Command::DescribePortal(self.name.clone()))
    }

    fn described(&mut self, result: PgResult) {
        self.description = Some(result.fields().clone());
        self.pgresult = Some(result);
        self.state = CursorState::Described;
    }

    /// `declare` then describe the portal.
    pub(crate) fn declare(
        &mut self,
        query: &str,
        params: Vec<Encoded>,
        options: DeclareOptions,
    ) -> Result<Declare<'_>> {
        match self.state {
            CursorState::Unbound => {},
            CursorState::Closed => return Err(StateError::CursorClosed.into()),
            CursorState::Declared | CursorState::Described => {
                return Err(StateError::CursorAlreadyExecuted.into());
            },
        }

        let sql = format!(
            "declare {} {}scroll cursor {}for {query}",
            Ident(&self.name),
            if options.scrollable { "" } else { "no " },
            if options.hold { "with hold " } else { "" },
        );
        self.hold = options.hold;

        Ok(Declare {
            phase: DeclarePhase::Declare(Execute::new(Command::query(sql, params))),
            helper: self,
        })
    }

    /// Describe the portal again.
    pub(crate) fn describe(&mut self) -> Result<OnPortal<'_>> {
        self.check_open()?;
        Ok(OnPortal { describe: Some(self.describe_command()), command: None, fetching: false, helper: self })
    }

    /// `fetch forward`, [`None`] fetches every remaining row.
    pub(crate) fn fetch(&mut self, count: Option<usize>) -> Result<OnPortal<'_>> {
        self.check_open()?;
        let sql = match count {
            Some(count) => {
                let mut buf = itoa::Buffer::new();
                format!("fetch forward {} from {}", buf.format(count), Ident(&self.name))
            },
            None => format!("fetch forward all from {}", Ident(&self.name)),
        };
        Ok(self.on_portal(sql, true))
    }

    /// `move`, the server decides whether the move is possible.
    pub(crate) fn scroll(&mut self, value: i64, mode: ScrollMode) -> Result<OnPortal<'_>> {
        self.check_open()?;
        let mut buf = itoa::Buffer::new();
        let sql = format!(
            "move {}{} from {}",
            match mode {
                ScrollMode::Relative => "",
                ScrollMode::Absolute => "absolute ",
            },
            buf.format(value),
            Ident(&self.name),
        );
        Ok(self.on_portal(sql, false))
    }

    fn on_portal(&mut self, sql: String, fetching: bool) -> OnPortal<'_> {
        let describe = match self.state {
            CursorState::Declared => Some(self.describe_command()),
            _ => None,
        };
        OnPortal { describe, command: Some(Execute::new(Command::Query(sql))), fetching, helper: self }
    }

    /// Transition to [`CursorState::Closed`] without any round trip.
    pub(crate) fn discard(&mut self) {
        self.state = CursorState::Closed;
    }

    /// Transition to [`CursorState::Closed`], returning the round trip that
    /// releases the portal if one is still expected on the server.
    ///
    /// No round trip is needed when nothing was bound, when the session is
    /// closed or its transaction failed, or when a cursor without hold
    /// outlived its transaction.
    pub(crate) fn close(&mut self, tx_status: TransactionStatus) -> Option<Close> {
        let state = mem::replace(&mut self.state, CursorState::Closed);
        if !matches!(state, CursorState::Declared | CursorState::Described) {
            return None;
        }

        match tx_status {
            TransactionStatus::InTransaction => {},
            TransactionStatus::Idle if self.hold || self.adopted => {},
            _ => return None,
        }

        // an adopted portal may already be gone
        let exists = self.adopted.then(|| {
            Execute::new(Command::QueryParams(
                "select 1 from pg_catalog.pg_cursors where name = $1".into(),
                vec![self.name.encode()],
            ))
        });
        let close = Execute::new(Command::Query(format!("close {}", Ident(&self.name))));

        Some(Close { exists, close })
    }
}

/// Declare then describe.
#[derive(Debug)]
pub(crate) struct Declare<'a> {
    helper: &'a mut NamedCursorHelper,
    phase: DeclarePhase,
}

#[derive(Debug)]
enum DeclarePhase {
    Declare(Execute),
    Describe(Execute),
}

impl PqGen for Declare<'_> {
    type Output = ();

    fn resume<T: PgTransport>(&mut self, conn: &mut T, mut ready: Ready) -> Result<Step<()>> {
        loop {
            match &mut self.phase {
                DeclarePhase::Declare(declare) => {
                    step!(declare.resume(conn, ready)?).check()?;
                    self.helper.state = CursorState::Declared;
                    self.phase = DeclarePhase::Describe(self.helper.describe_command());
                    ready = Ready::NONE;
                },
                DeclarePhase::Describe(describe) => {
                    let result = step!(describe.resume(conn, ready)?).check()?;
                    self.helper.described(result);
                    return Ok(Step::Done(()));
                },
            }
        }
    }
}

/// A command on the bound portal, described first if needed.
///
/// Completes with the rows returned by the command. A fetch result is
/// kept as the cursor's last result.
#[derive(Debug)]
pub(crate) struct OnPortal<'a> {
    helper: &'a mut NamedCursorHelper,
    describe: Option<Execute>,
    command: Option<Execute>,
    fetching: bool,
}

impl PqGen for OnPortal<'_> {
    type Output = Vec<Row>;

    fn resume<T: PgTransport>(&mut self, conn: &mut T, mut ready: Ready) -> Result<Step<Vec<Row>>> {
        if let Some(describe) = &mut self.describe {
            let result = step!(describe.resume(conn, ready)?).check()?;
            self.describe = None;
            self.helper.described(result);
            ready = Ready::NONE;
        }
        let Some(command) = &mut self.command else {
            return Ok(Step::Done(Vec::new()));
        };
        let result = step!(command.resume(conn, ready)?).check()?;
        if !self.fetching {
            return Ok(Step::Done(result.into_rows()));
        }
        let rows = result.rows().to_vec();
        self.helper.pgresult = Some(result);
        Ok(Step::Done(rows))
    }
}

/// Release the portal.
#[derive(Debug)]
pub(crate) struct Close {
    exists: Option<Execute>,
    close: Execute,
}

impl PqGen for Close {
    type Output = ();

    fn resume<T: PgTransport>(&mut self, conn: &mut T, mut ready: Ready) -> Result<Step<()>> {
        if let Some(exists) = &mut self.exists {
            let result = step!(exists.resume(conn, ready)?).check()?;
            self.exists = None;
            if result.ntuples() == 0 {
                return Ok(Step::Done(()));
            }
            ready = Ready::NONE;
        }
        step!(self.close.resume(conn, ready)?).check()?;
        Ok(Step::Done(()))
    }
}
