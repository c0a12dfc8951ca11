use serde::{Deserialize, Serialize};

/// A template line of a batch: `count` copies of the same command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(rename = "Count")]
    pub count: usize,
    #[serde(rename = "Args")]
    pub args: Vec<String>,
}

impl TaskSpec {
    pub fn new(count: usize, args: Vec<String>) -> Self {
        Self { count, args }
    }
}

/// One dispatchable unit of work. This is also the JSON body of the
/// START, JOBFINISHED and JOBERROR messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Job {
    #[serde(rename = "SubId")]
    pub batch_id: String,
    #[serde(rename = "LineId")]
    pub line_id: usize,
    #[serde(rename = "JobId")]
    pub task_id: u64,
    #[serde(rename = "Args")]
    pub args: Vec<String>,
}

impl Job {
    pub fn new(batch_id: String, line_id: usize, task_id: u64, args: Vec<String>) -> Self {
        Self {
            batch_id,
            line_id,
            task_id,
            args,
        }
    }

    /// Key used for kill bookkeeping and in-flight tracking
    pub fn key(&self) -> (String, u64) {
        (self.batch_id.clone(), self.task_id)
    }

    /// Full argv handed to the child: the task's own args followed by the
    /// batch id, line id and task id, in that order.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = self.args.clone();
        argv.push(self.batch_id.clone());
        argv.push(self.line_id.to_string());
        argv.push(self.task_id.to_string());
        argv
    }

    pub fn command_line(&self) -> String {
        self.args.join(" ")
    }
}

/// Total number of jobs a batch expands to
pub fn total_tasks(tasks: &[TaskSpec]) -> usize {
    tasks.iter().map(|t| t.count).sum()
}

/// Expand task lines into jobs, in line order, with task ids counting up from 0.
pub fn expand_tasks(batch_id: &str, tasks: &[TaskSpec]) -> Vec<Job> {
    let mut jobs = Vec::with_capacity(total_tasks(tasks));
    let mut task_id = 0u64;
    for (line_id, spec) in tasks.iter().enumerate() {
        for _ in 0..spec.count {
            jobs.push(Job::new(
                batch_id.to_string(),
                line_id,
                task_id,
                spec.args.clone(),
            ));
            task_id += 1;
        }
    }
    jobs
}
