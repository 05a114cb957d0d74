//! Exposes testing, profiling and tracing capabilities of commits.

use crate::entity::Location;
use crate::table::TableId;
use crate::{Entity, Signature};

/// Defines the [`Tracer`] trait and implements the [`Log`] and [`Aggregate`] types.
///
/// All tracer method parameters must be [`Copy`].
macro_rules! define_tracer {
    (
        $(
            $(#[$meta:meta])*
            fn $name:ident(&self $(, $arg_ident:ident: $arg_ty:ty)*);
        )*
    ) => {
        /// A tracer used for recording the events throughout a commit.
        ///
        /// Can be used for profiling and testing.
        /// Compaction events may be reported from several threads concurrently.
        pub trait Tracer: Sync {
            $(
                $(#[$meta])*
                #[allow(unused_variables)]
                fn $name(&self, $($arg_ident: $arg_ty,)*) {}
            )*
        }

        impl Tracer for Log {
            $(
                fn $name(&self, $($arg_ident: $arg_ty,)*) {
                    log::log!(self.0, concat!(stringify!($name), "(", $(
                        stringify!($arg_ident),
                        " = {",
                        stringify!($arg_ident),
                        ":?}, ",
                    )* ")"), $(
                        $arg_ident = $arg_ident,
                    )*);
                }
            )*
        }

        impl_tuple_accumulate! {
            @TYPES (T1, T2, T3, T4, T5, T6, T7, T8);
            $(
                @VARS (t1, t2, t3, t4, t5, t6, t7, t8);
                @METHOD {fn $name(&self, $($arg_ident: $arg_ty,)*);}
            )*
        }
    };
}

macro_rules! impl_tuple {
    (
        @TYPES ($($ty:ident),* $(,)?);
        $(
            @VARS ($($vars:ident),* $(,)?);
            @METHOD {fn $name:ident(&self, $($arg_ident:ident: $arg_ty:ty,)*);}
        )*
    ) => {
        impl<$($ty: Tracer),*> Tracer for Aggregate<($($ty,)*)> {
            $(
                fn $name(&self, $($arg_ident: $arg_ty),*) {
                    #[allow(unused_mut, unused_variables)]
                    let mut args = ($($arg_ident,)*);

                    #[allow(dead_code)]
                    fn call_with_args(tracer: &impl Tracer, ($($arg_ident,)*): &mut ($($arg_ty,)*)) {
                        tracer.$name($(*$arg_ident,)*);
                    }

                    let Aggregate(($($vars,)*)) = self;
                    $(
                        call_with_args($vars, &mut args);
                    )*
                }
            )*
        }
    };
}

macro_rules! impl_tuple_accumulate {
    (@TYPES (); $(@VARS (); @METHOD {$($body:tt)*})*) => {};
    (
        @TYPES ($first_ty:ident $(, $rest_ty:ident)* $(,)?);
        $(
            @VARS ($first_var:ident $(, $rest_var:ident)* $(,)?);
            @METHOD {$($body:tt)*}
        )*
    ) => {
        impl_tuple! {
            @TYPES ($first_ty $(, $rest_ty)* );
            $(
                @VARS ($first_var $(, $rest_var)*);
                @METHOD {$($body)*}
            )*
        }

        impl_tuple_accumulate! {
            @TYPES ($($rest_ty),*);
            $(
                @VARS ($($rest_var),*);
                @METHOD {$($body)*}
            )*
        }
    };
}

define_tracer! {
    /// A commit starts with staged operations for `entities` entities.
    fn start_commit(&self, entities: usize);

    /// A table is created for a new archetype.
    fn create_table(&self, table: TableId, signature: &Signature);

    /// An entity is moved into a row of another archetype.
    ///
    /// `from` is `None` if the entity had no components.
    fn migrate_entity(&self, entity: &Entity, from: Option<Location>, to: Location);

    /// Components of an entity are replaced without changing its archetype.
    fn overwrite_entity(&self, entity: &Entity, location: Location, components: usize);

    /// An entity loses all its components.
    fn release_entity(&self, entity: &Entity, from: Location);

    /// A table is compacted.
    fn compact_table(&self, table: TableId, moved_rows: usize, freed_pages: usize);

    /// A commit ends. `new_tables` is whether any table was created.
    fn end_commit(&self, new_tables: bool);
}

/// An empty tracer.
pub struct Noop;

impl Tracer for Noop {}

/// Groups multiple tracers into a tuple and dispatches each call to them in serial.
pub struct Aggregate<T>(
    /// A tuple of child tracers to execute in serial.
    pub T,
);

/// A tracer that logs all events.
pub struct Log(
    /// The log level to log events with.
    pub log::Level,
);

#[cfg(test)]
mod tests {
    use super::{Aggregate, Log, Noop, Tracer};
    use crate::table::TableId;
    use crate::test_util::{self, Event, Recorder};

    #[test]
    fn test_aggregate_dispatches_in_order() {
        test_util::init();

        let tracer = Aggregate((Recorder::default(), Noop, Log(log::Level::Trace), Recorder::default()));

        tracer.start_commit(3);
        tracer.compact_table(TableId(1), 2, 0);
        tracer.end_commit(false);

        let Aggregate((first, _, _, second)) = &tracer;
        assert_eq!(first.events(), second.events());
        assert_eq!(first.events()[0], Event::StartCommit(3));
        assert_eq!(first.events()[2], Event::EndCommit(false));
    }
}
