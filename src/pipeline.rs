/*!
    Cooperative scheduler running the housekeeping a little at a time.

    The housekeeping of a bus is made of many blocking accesses, each taking a significant part of a cycle. The [Executor] runs at most one of them per call, so each housekeeping pass stays short and every slave gets its turn in a fixed round-robin order.

    Tasks are gathered in a ring. Each call skips the tasks with nothing to do, runs the first one that has, and moves past it only when it reports it is done, so a long job can be split over several calls without ever blocking the other tasks more than one step.
*/


/// one step of the housekeeping, working on a shared context `C`
pub trait Task<C>: Send {
    /// name reported in diagnostics
    fn name(&self) -> &'static str;
    /// true when there is nothing to do for now, this must not have side effects
    fn skip(&self, _context: &C) -> bool  {false}
    /// true for markers that are only passed over
    fn run_next_immediately(&self) -> bool  {false}
    /// run one step, returns true if the task is done and the next one can run
    fn execute(&mut self, context: &mut C, runtime: i64) -> bool;
}

/// pass-through task marking the start or the end of a group of tasks
pub struct Marker(pub &'static str);
impl<C> Task<C> for Marker {
    fn name(&self) -> &'static str  {self.0}
    fn run_next_immediately(&self) -> bool  {true}
    fn execute(&mut self, _context: &mut C, _runtime: i64) -> bool  {true}
}

/// ring of tasks with a cursor
pub struct Executor<C> {
    tasks: Vec<Box<dyn Task<C>>>,
    current: usize,
    last: usize,
}

impl<C> Default for Executor<C> {
    fn default() -> Self  {Self {tasks: Vec::new(), current: 0, last: 0}}
}

impl<C> Executor<C> {
    pub fn new() -> Self  {Self::default()}

    /// append a group of tasks surrounded by markers
    pub fn push_bin(&mut self, name: &'static str, tasks: Vec<Box<dyn Task<C>>>) {
        self.tasks.push(Box::new(Marker(name)));
        self.tasks.extend(tasks);
        self.tasks.push(Box::new(Marker("end")));
    }
    pub fn len(&self) -> usize  {self.tasks.len()}
    pub fn is_empty(&self) -> bool  {self.tasks.is_empty()}
    /// index of the task that will be considered first by the next call to [Self::execute]
    pub fn current(&self) -> usize  {self.current}

    /**
        run the first task in the ring that has something to do

        Returns false if every task was skipped for a full lap.
    */
    pub fn execute(&mut self, context: &mut C, runtime: i64) -> bool {
        if self.tasks.is_empty()
            {return false}
        let start = self.current;
        loop {
            let task = &self.tasks[self.current];
            if ! task.run_next_immediately() && ! task.skip(context)
                {break}
            self.advance();
            if self.current == start
                {return false}
        }
        self.last = self.current;
        if self.tasks[self.current].execute(context, runtime)
            {self.advance()}
        true
    }

    /// name of the last task executed, for diagnostics
    pub fn last_executed(&self) -> &'static str {
        self.tasks.get(self.last).map_or("", |task| task.name())
    }

    fn advance(&mut self) {
        self.current += 1;
        if self.current >= self.tasks.len()
            {self.current = 0}
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    /// records its runs in the context, and needs `steps` calls to finish
    struct Counting {
        name: &'static str,
        steps: usize,
        done: usize,
        idle: bool,
    }
    impl Counting {
        fn new(name: &'static str, steps: usize) -> Box<dyn Task<Vec<&'static str>>> {
            Box::new(Self {name, steps, done: 0, idle: false})
        }
        fn idle(name: &'static str) -> Box<dyn Task<Vec<&'static str>>> {
            Box::new(Self {name, steps: 1, done: 0, idle: true})
        }
    }
    impl Task<Vec<&'static str>> for Counting {
        fn name(&self) -> &'static str  {self.name}
        fn skip(&self, _: &Vec<&'static str>) -> bool  {self.idle}
        fn execute(&mut self, trace: &mut Vec<&'static str>, _: i64) -> bool {
            trace.push(self.name);
            self.done += 1;
            if self.done == self.steps {
                self.done = 0;
                true
            }
            else {false}
        }
    }

    #[test]
    fn round_robin() {
        let mut executor = Executor::new();
        executor.push_bin("first", vec![Counting::new("a", 1), Counting::idle("b"), Counting::new("c", 2)]);
        executor.push_bin("second", vec![Counting::new("d", 1)]);
        let mut trace = Vec::new();
        for _ in 0 .. 8 {
            assert!(executor.execute(&mut trace, 0));
        }
        assert_eq!(trace, ["a", "c", "c", "d", "a", "c", "c", "d"]);
        assert_eq!(executor.last_executed(), "d");
    }

    #[test]
    fn fair_share() {
        let names = ["a", "b", "c", "d", "e"];
        for ticks in [5, 7, 13, 64] {
            let mut executor = Executor::new();
            executor.push_bin("first", names[.. 2].iter().map(|&name| Counting::new(name, 1)).collect());
            executor.push_bin("second", names[2 ..].iter().map(|&name| Counting::new(name, 1)).collect());
            let mut trace = Vec::new();
            for _ in 0 .. ticks {
                executor.execute(&mut trace, 0);
            }
            assert_eq!(trace.len(), ticks);
            for name in names {
                let runs = trace.iter().filter(|&&run| run == name).count();
                assert!(
                    runs == ticks / names.len() || runs == ticks.div_ceil(names.len()),
                    "{} ran {} times in {} ticks", name, runs, ticks);
            }
        }
    }

    #[test]
    fn all_skipped() {
        let mut executor = Executor::new();
        executor.push_bin("idle", vec![Counting::idle("a"), Counting::idle("b")]);
        let mut trace = Vec::new();
        let start = executor.current();
        assert!(! executor.execute(&mut trace, 0));
        assert!(trace.is_empty());
        // a full lap brings the cursor back where it was
        assert_eq!(executor.current(), start);
        assert!(! Executor::<Vec<&'static str>>::new().execute(&mut trace, 0));
    }
}
